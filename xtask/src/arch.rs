// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{anyhow, Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UefiArch {
    AArch64,
    IA32,
    #[default]
    X86_64,
}

impl UefiArch {
    fn all() -> &'static [Self] {
        &[Self::AArch64, Self::IA32, Self::X86_64]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::AArch64 => "aarch64",
            Self::IA32 => "ia32",
            Self::X86_64 => "x86_64",
        }
    }

    pub fn as_triple(self) -> &'static str {
        match self {
            Self::AArch64 => "aarch64-unknown-uefi",
            Self::IA32 => "i686-unknown-uefi",
            Self::X86_64 => "x86_64-unknown-uefi",
        }
    }

    /// Name of the removable-media boot file that firmware looks for in
    /// `\EFI\BOOT`.
    pub fn boot_file_name(self) -> &'static str {
        match self {
            Self::AArch64 => "BootAA64.efi",
            Self::IA32 => "BootIA32.efi",
            Self::X86_64 => "BootX64.efi",
        }
    }

    pub fn qemu_exe(self) -> &'static str {
        match self {
            Self::AArch64 => "qemu-system-aarch64",
            Self::IA32 | Self::X86_64 => "qemu-system-x86_64",
        }
    }
}

impl fmt::Display for UefiArch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UefiArch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .find(|arch| arch.as_str() == s)
            .copied()
            .ok_or_else(|| anyhow!("invalid arch: {}", s))
    }
}
