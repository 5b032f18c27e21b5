// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use flexi_logger::Logger;
use std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialization function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. Drives log output from the `RUST_LOG`
/// environment variable; safe to call more than once.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env() {
            let _ = logger.start();
        }
    });
}
