// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod mbuf;
mod mem;
mod mempool;

//==============================================================================
// Exports
//==============================================================================

pub(crate) use self::mbuf::prefetch;
pub use self::{
    mbuf::Mbuf,
    mem::{
        align_ceil,
        align_floor,
        PGSIZE_4KB,
    },
    mempool::{
        MemChunk,
        Mempool,
        DEFAULT_HEADROOM,
    },
};
