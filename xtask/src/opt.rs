// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::arch::UefiArch;
use crate::esp::EspLayout;
use clap::{Parser, Subcommand};
use std::ops::Deref;
use std::path::PathBuf;

// Define some common options so that the doc strings don't have to be
// copy-pasted.

#[derive(Debug, Parser)]
pub struct TargetOpt {
    /// UEFI target to build for.
    #[clap(long, action, default_value_t)]
    pub target: UefiArch,
}

impl Deref for TargetOpt {
    type Target = UefiArch;

    fn deref(&self) -> &Self::Target {
        &self.target
    }
}

#[derive(Debug, Parser)]
pub struct BuildModeOpt {
    /// Build in release mode.
    #[clap(long, action)]
    pub release: bool,
}

#[derive(Debug, Parser)]
pub struct WarningOpt {
    /// Treat warnings as errors.
    #[clap(long, action)]
    pub warnings_as_errors: bool,
}

/// Paths of user-provided OVMF files. Unset files are downloaded.
#[derive(Debug, Default, Parser)]
pub struct OvmfOpt {
    /// Path of an OVMF code file.
    #[clap(long, action, env = "OVMF_CODE")]
    pub ovmf_code: Option<PathBuf>,

    /// Path of an OVMF vars file.
    #[clap(long, action, env = "OVMF_VARS")]
    pub ovmf_vars: Option<PathBuf>,

    /// Path of a UEFI shell executable.
    #[clap(long, action, env = "OVMF_SHELL")]
    pub ovmf_shell: Option<PathBuf>,
}

/// Developer utility for building and running hello-efi.
#[derive(Debug, Parser)]
pub struct Opt {
    #[clap(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    Build(BuildOpt),
    Clippy(ClippyOpt),
    Image(ImageOpt),
    Run(QemuOpt),
    Test(TestOpt),
}

/// Build hello-efi and lay out an EFI system partition directory.
#[derive(Debug, Parser)]
pub struct BuildOpt {
    #[clap(flatten)]
    pub target: TargetOpt,

    #[clap(flatten)]
    pub build_mode: BuildModeOpt,

    /// How the application is launched from the partition.
    #[clap(long, action, value_enum, default_value_t)]
    pub layout: EspLayout,

    #[clap(flatten)]
    pub ovmf: OvmfOpt,
}

/// Run clippy on all the packages.
#[derive(Debug, Parser)]
pub struct ClippyOpt {
    #[clap(flatten)]
    pub target: TargetOpt,

    #[clap(flatten)]
    pub warning: WarningOpt,
}

/// Build hello-efi and write a bootable disk image.
#[derive(Debug, Parser)]
pub struct ImageOpt {
    #[clap(flatten)]
    pub target: TargetOpt,

    #[clap(flatten)]
    pub build_mode: BuildModeOpt,

    /// Path of the disk image to write. Defaults to `hello-efi.img` in
    /// the target directory.
    #[clap(long, action)]
    pub output: Option<PathBuf>,
}

/// Build hello-efi and run it in QEMU.
#[derive(Debug, Parser)]
pub struct QemuOpt {
    #[clap(flatten)]
    pub target: TargetOpt,

    #[clap(flatten)]
    pub build_mode: BuildModeOpt,

    #[clap(flatten)]
    pub ovmf: OvmfOpt,

    /// Disable hardware accelerated virtualization support in QEMU.
    #[clap(long, action)]
    pub disable_kvm: bool,

    /// Run QEMU without a GUI.
    #[clap(long, action)]
    pub headless: bool,

    /// Attach the serial console to the terminal instead of checking
    /// the application's output.
    #[clap(long, action)]
    pub interactive: bool,

    /// Seconds to wait for the VM to shut down.
    #[clap(long, action, default_value_t = 120)]
    pub timeout: u64,
}

/// Run unit tests on the host.
#[derive(Debug, Parser)]
pub struct TestOpt;
