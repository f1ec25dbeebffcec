// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layout of the EFI system partition (ESP) directory that QEMU mounts
//! and that the disk image is filled from.

use crate::arch::UefiArch;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::Path;

/// File name of the application inside `\EFI\BOOT` when it is launched
/// from the shell.
pub const APP_FILE_NAME: &str = "hello-efi.efi";

/// Prefix of the line the startup script prints with the application's
/// exit status.
pub const STATUS_MARKER: &str = "HELLO_EFI_STATUS=";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum EspLayout {
    /// The application is the removable-media boot file, so firmware
    /// starts it directly.
    #[default]
    Direct,

    /// The UEFI shell is the boot file. Its startup script runs the
    /// application, prints the exit status and powers off the machine.
    Shell,
}

/// Contents of `startup.nsh` for the given layout.
///
/// Line endings are CRLF since the shell is a UEFI program.
pub fn startup_script(arch: UefiArch, layout: EspLayout) -> String {
    let lines = match layout {
        EspLayout::Direct => vec![format!(
            r"\EFI\BOOT\{}",
            arch.boot_file_name().to_ascii_uppercase()
        )],
        EspLayout::Shell => vec![
            "@echo -off".to_string(),
            "fs0:".to_string(),
            format!(r"\EFI\BOOT\{APP_FILE_NAME}"),
            format!("echo {STATUS_MARKER}%lasterror%"),
            "reset -s".to_string(),
        ],
    };
    lines.iter().map(|line| format!("{line}\r\n")).collect()
}

/// Fill `esp_dir` with the boot files for `layout`. Any previous
/// contents of the directory are removed first.
///
/// `shell` is the UEFI shell executable; it is only used (and required)
/// for [`EspLayout::Shell`].
pub fn create_esp_dir(
    esp_dir: &Path,
    arch: UefiArch,
    layout: EspLayout,
    app: &Path,
    shell: Option<&Path>,
) -> Result<()> {
    if esp_dir.exists() {
        fs_err::remove_dir_all(esp_dir)?;
    }
    let boot_dir = esp_dir.join("EFI").join("BOOT");
    fs_err::create_dir_all(&boot_dir)?;

    match layout {
        EspLayout::Direct => {
            fs_err::copy(app, boot_dir.join(arch.boot_file_name()))?;
        }
        EspLayout::Shell => {
            let Some(shell) = shell else {
                bail!("the shell layout needs a UEFI shell executable");
            };
            fs_err::copy(shell, boot_dir.join(arch.boot_file_name()))?;
            fs_err::copy(app, boot_dir.join(APP_FILE_NAME))?;
        }
    }

    fs_err::write(esp_dir.join("startup.nsh"), startup_script(arch, layout))?;

    Ok(())
}
