// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::arch::UefiArch;
use anyhow::{bail, Result};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

#[derive(Clone, Copy, Debug)]
pub enum Package {
    HelloEfi,
    Xtask,
}

impl Package {
    fn as_str(self) -> &'static str {
        match self {
            Self::HelloEfi => "hello-efi",
            Self::Xtask => "xtask",
        }
    }

    /// Packages that are built for a UEFI target.
    pub fn uefi() -> Vec<Package> {
        vec![Self::HelloEfi]
    }
}

#[derive(Clone, Copy, Debug)]
pub enum CargoAction {
    Build,
    Clippy,
    Test,
}

/// Get a modified PATH to remove entries added by rustup. This is
/// necessary on Windows, see
/// https://github.com/rust-lang/rustup/issues/3031.
fn sanitized_path(orig_path: OsString) -> OsString {
    let paths = env::split_paths(&orig_path);
    let sanitized_paths = paths.filter(|path| {
        !path
            .components()
            .any(|component| component.as_os_str() == ".rustup")
    });

    env::join_paths(sanitized_paths).expect("invalid PATH")
}

/// Cargo automatically sets some env vars that can prevent the
/// channel arg (e.g. "+nightly") from working. Unset them in the
/// child's environment.
pub fn fix_nested_cargo_env(cmd: &mut Command) {
    cmd.env_remove("RUSTC");
    cmd.env_remove("RUSTDOC");
    let orig_path = env::var_os("PATH").unwrap_or_default();
    cmd.env("PATH", sanitized_path(orig_path));
}

/// Directory that cargo writes the artifacts of a UEFI build into.
pub fn target_dir(arch: UefiArch, release: bool) -> PathBuf {
    let build_mode = if release { "release" } else { "debug" };
    PathBuf::from("target").join(arch.as_triple()).join(build_mode)
}

#[derive(Debug)]
pub struct Cargo {
    pub action: CargoAction,
    pub packages: Vec<Package>,
    pub release: bool,
    pub target: Option<UefiArch>,
    pub warnings_as_errors: bool,
}

impl Cargo {
    pub fn command(&self) -> Result<Command> {
        let mut cmd = Command::new("cargo");

        fix_nested_cargo_env(&mut cmd);

        let mut tool_args: Vec<&str> = Vec::new();
        let action = match self.action {
            CargoAction::Build => "build",
            CargoAction::Clippy => {
                if self.warnings_as_errors {
                    tool_args.extend(["-D", "warnings"]);
                }
                "clippy"
            }
            CargoAction::Test => "test",
        };
        cmd.arg(action);

        if self.release {
            cmd.arg("--release");
        }

        if let Some(target) = self.target {
            cmd.args(["--target", target.as_triple()]);
        }

        if self.packages.is_empty() {
            bail!("packages cannot be empty");
        }
        for package in &self.packages {
            cmd.args(["--package", package.as_str()]);
        }

        if !tool_args.is_empty() {
            cmd.arg("--");
            cmd.args(tool_args);
        }

        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::command_to_string;

    #[test]
    fn test_sanitize_path() {
        let (input, expected) = match env::consts::FAMILY {
            "unix" => ("Abc:/path/.rustup/cargo:Xyz", "Abc:Xyz"),
            "windows" => ("Abc;/path/.rustup/cargo;Xyz", "Abc;Xyz"),
            _ => unimplemented!(),
        };

        assert_eq!(sanitized_path(input.into()), expected);
    }

    #[test]
    fn test_build_command() {
        let cargo = Cargo {
            action: CargoAction::Build,
            packages: Package::uefi(),
            release: true,
            target: Some(UefiArch::AArch64),
            warnings_as_errors: false,
        };
        assert_eq!(
            command_to_string(&cargo.command().unwrap()),
            "cargo build --release --target aarch64-unknown-uefi --package hello-efi"
        );
    }

    #[test]
    fn test_clippy_command() {
        let cargo = Cargo {
            action: CargoAction::Clippy,
            packages: vec![Package::Xtask],
            release: false,
            target: None,
            warnings_as_errors: true,
        };
        assert_eq!(
            command_to_string(&cargo.command().unwrap()),
            "cargo clippy --package xtask -- -D warnings"
        );
    }

    #[test]
    fn test_empty_packages() {
        let cargo = Cargo {
            action: CargoAction::Test,
            packages: Vec::new(),
            release: false,
            target: None,
            warnings_as_errors: false,
        };
        assert!(cargo.command().is_err());
    }

    #[test]
    fn test_target_dir() {
        assert_eq!(
            target_dir(UefiArch::X86_64, false),
            PathBuf::from("target/x86_64-unknown-uefi/debug")
        );
    }
}
