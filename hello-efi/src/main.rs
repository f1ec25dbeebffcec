// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal UEFI application: greets the console once and hands control back
//! to the firmware.

#![no_main]
#![no_std]

use log::{debug, warn, LevelFilter};
use uefi::prelude::*;

#[entry]
fn main() -> Status {
    // The logger is optional here; the greeting goes straight to ConOut.
    if uefi::helpers::init().is_ok() {
        // Release builds keep the console down to the greeting.
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
        debug!(
            "UEFI {} ({} rev {:#x})",
            system::uefi_revision(),
            system::firmware_vendor(),
            system::firmware_revision()
        );
    }

    if let Err(err) = greet() {
        warn!("failed to write greeting: {:?}", err.status());
    }

    Status::SUCCESS
}

/// Write the greeting to the primary console output.
fn greet() -> uefi::Result {
    system::with_stdout(|stdout| stdout.output_string(cstr16!("Hello World!\r\n")))
}
