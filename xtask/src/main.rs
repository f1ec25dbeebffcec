// SPDX-License-Identifier: MIT OR Apache-2.0

mod arch;
mod cargo;
mod disk;
mod esp;
mod opt;
mod ovmf;
mod qemu;
mod util;

use anyhow::{bail, Result};
use arch::UefiArch;
use cargo::{Cargo, CargoAction, Package};
use clap::Parser;
use esp::EspLayout;
use opt::{Action, BuildOpt, ClippyOpt, ImageOpt, Opt, OvmfOpt, QemuOpt};
use ovmf::OvmfPaths;
use ovmf_prebuilt::FileType;
use std::path::{Path, PathBuf};
use util::run_cmd;

/// Build hello-efi and return the path of the resulting executable.
fn build_app(arch: UefiArch, release: bool) -> Result<PathBuf> {
    let cargo = Cargo {
        action: CargoAction::Build,
        packages: Package::uefi(),
        release,
        target: Some(arch),
        warnings_as_errors: false,
    };
    run_cmd(cargo.command()?)?;

    Ok(cargo::target_dir(arch, release).join("hello-efi.efi"))
}

/// Build hello-efi and lay out the ESP directory next to it.
fn build_esp(
    arch: UefiArch,
    release: bool,
    layout: EspLayout,
    ovmf_opt: &OvmfOpt,
) -> Result<PathBuf> {
    let app = build_app(arch, release)?;

    let shell = match layout {
        EspLayout::Direct => None,
        EspLayout::Shell => Some(ovmf::find_ovmf_file(FileType::Shell, ovmf_opt, arch)?),
    };

    let esp_dir = cargo::target_dir(arch, release).join("esp");
    esp::create_esp_dir(&esp_dir, arch, layout, &app, shell.as_deref())?;

    Ok(esp_dir)
}

fn build(opt: &BuildOpt) -> Result<()> {
    let esp_dir = build_esp(*opt.target, opt.build_mode.release, opt.layout, &opt.ovmf)?;
    println!("ESP directory: {}", esp_dir.display());
    Ok(())
}

fn clippy(opt: &ClippyOpt) -> Result<()> {
    // Run clippy on the UEFI packages.
    let cargo = Cargo {
        action: CargoAction::Clippy,
        packages: Package::uefi(),
        release: false,
        target: Some(*opt.target),
        warnings_as_errors: opt.warning.warnings_as_errors,
    };
    run_cmd(cargo.command()?)?;

    // Run clippy on xtask.
    let cargo = Cargo {
        action: CargoAction::Clippy,
        packages: vec![Package::Xtask],
        release: false,
        target: None,
        warnings_as_errors: opt.warning.warnings_as_errors,
    };
    run_cmd(cargo.command()?)
}

/// Build a bootable disk image and check that the boot file made it in.
fn image(opt: &ImageOpt) -> Result<()> {
    let arch = *opt.target;
    let release = opt.build_mode.release;
    let esp_dir = build_esp(arch, release, EspLayout::Direct, &OvmfOpt::default())?;

    let image_path = opt
        .output
        .clone()
        .unwrap_or_else(|| cargo::target_dir(arch, release).join("hello-efi.img"));
    disk::create_esp_disk_image(&esp_dir, &image_path)?;

    let boot_file = Path::new("EFI/BOOT").join(arch.boot_file_name());
    let expected = fs_err::read(esp_dir.join(&boot_file))?;
    let boot_file = boot_file.to_string_lossy().replace('\\', "/");
    if disk::read_esp_file(&image_path, &boot_file)? != expected {
        bail!("{boot_file} in {} is corrupt", image_path.display());
    }

    println!("Disk image: {}", image_path.display());
    Ok(())
}

/// Build hello-efi and boot it in QEMU.
///
/// Normally the shell launches the application and powers off, and the
/// serial output is checked. In interactive mode the application is the
/// boot file and the console is left to the user.
fn run_vm(opt: &QemuOpt) -> Result<()> {
    let arch = *opt.target;
    let layout = if opt.interactive {
        EspLayout::Direct
    } else {
        EspLayout::Shell
    };

    let esp_dir = build_esp(arch, opt.build_mode.release, layout, &opt.ovmf)?;
    let ovmf_paths = OvmfPaths::find(&opt.ovmf, arch)?;

    qemu::run_qemu(arch, opt, &ovmf_paths, &esp_dir)
}

/// Run unit tests on the host. The application itself only runs under
/// firmware, so it is covered by `run` instead.
fn run_host_tests() -> Result<()> {
    let cargo = Cargo {
        action: CargoAction::Test,
        packages: vec![Package::Xtask],
        release: false,
        target: None,
        warnings_as_errors: false,
    };
    run_cmd(cargo.command()?)
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    match &opt.action {
        Action::Build(build_opt) => build(build_opt),
        Action::Clippy(clippy_opt) => clippy(clippy_opt),
        Action::Image(image_opt) => image(image_opt),
        Action::Run(qemu_opt) => run_vm(qemu_opt),
        Action::Test(_) => run_host_tests(),
    }
}
