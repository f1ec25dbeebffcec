// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locating the OVMF firmware and UEFI shell used to boot the application.

use crate::arch::UefiArch;
use crate::opt::OvmfOpt;
use anyhow::{bail, Result};
use ovmf_prebuilt::{FileType, Prebuilt, Source};
use std::path::PathBuf;

/// Name of the ovmf-prebuilt release to use by default.
const OVMF_PREBUILT_SOURCE: Source = Source::EDK2_STABLE202502_R2;

/// Directory into which the prebuilts will be download (relative to the repo root).
const OVMF_PREBUILT_DIR: &str = "target/ovmf";

impl From<UefiArch> for ovmf_prebuilt::Arch {
    fn from(arch: UefiArch) -> Self {
        match arch {
            UefiArch::AArch64 => Self::Aarch64,
            UefiArch::IA32 => Self::Ia32,
            UefiArch::X86_64 => Self::X64,
        }
    }
}

/// Get a user-provided path for the given OVMF file type.
///
/// This can come from an explicit CLI arg or an environment variable, depending
/// on how clap received and parsed the value.
fn get_user_provided_path(file_type: FileType, opt: &OvmfOpt) -> Option<PathBuf> {
    match file_type {
        FileType::Code => opt.ovmf_code.clone(),
        FileType::Vars => opt.ovmf_vars.clone(),
        FileType::Shell => opt.ovmf_shell.clone(),
    }
}

/// Search for an OVMF file.
///
/// There are multiple locations where a file is searched at in the following
/// priority:
/// 1. Command-line arg
/// 2. Environment variable
/// 3. Prebuilt file (automatically downloaded)
pub fn find_ovmf_file(file_type: FileType, opt: &OvmfOpt, arch: UefiArch) -> Result<PathBuf> {
    if let Some(path) = get_user_provided_path(file_type, opt) {
        // The user provided an exact path to use; verify that it
        // exists.
        if path.exists() {
            Ok(path)
        } else {
            bail!(
                "ovmf {} file does not exist: {}",
                file_type.as_str(),
                path.display()
            );
        }
    } else {
        let prebuilt = Prebuilt::fetch(OVMF_PREBUILT_SOURCE, OVMF_PREBUILT_DIR)?;

        Ok(prebuilt.get_file(arch.into(), file_type))
    }
}

pub struct OvmfPaths {
    pub code: PathBuf,
    pub vars: PathBuf,
}

impl OvmfPaths {
    /// Find the firmware code and vars files by the strategy documented
    /// for [`find_ovmf_file`].
    pub fn find(opt: &OvmfOpt, arch: UefiArch) -> Result<Self> {
        let code = find_ovmf_file(FileType::Code, opt, arch)?;
        let vars = find_ovmf_file(FileType::Vars, opt, arch)?;

        Ok(Self { code, vars })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_path_must_exist() {
        let opt = OvmfOpt {
            ovmf_code: Some(PathBuf::from("/nonexistent/OVMF_CODE.fd")),
            ..Default::default()
        };
        let err = find_ovmf_file(FileType::Code, &opt, UefiArch::X86_64).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_user_path_is_used() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let opt = OvmfOpt {
            ovmf_shell: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(
            find_ovmf_file(FileType::Shell, &opt, UefiArch::AArch64).unwrap(),
            tmp.path()
        );
    }
}
