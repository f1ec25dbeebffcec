// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::arch::UefiArch;
use crate::esp::STATUS_MARKER;
use crate::opt::QemuOpt;
use crate::ovmf::OvmfPaths;
use crate::util::command_to_string;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::env::{self, consts};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
#[cfg(target_os = "linux")]
use {std::fs::Permissions, std::os::unix::fs::PermissionsExt};

/// Line the application writes to the console.
const GREETING: &str = "Hello World!";

enum PflashMode {
    ReadOnly,
    ReadWrite,
}

fn add_pflash_args(cmd: &mut Command, file: &Path, mode: PflashMode) {
    // Build the argument as an OsString to avoid requiring a UTF-8 path.
    let mut arg = OsString::from("if=pflash,format=raw,readonly=");
    arg.push(match mode {
        PflashMode::ReadOnly => "on",
        PflashMode::ReadWrite => "off",
    });
    arg.push(",file=");
    arg.push(file);

    cmd.arg("-drive");
    cmd.arg(arg);
}

/// Console output of one VM run, reduced to the facts that get checked.
pub struct Transcript {
    ansi_escape: Regex,
    greetings: usize,
    stray_greetings: usize,
    exit_status: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            // Detects ANSI escape codes. These are added by the console
            // output protocol when writing to the serial device.
            ansi_escape: Regex::new(r"(\x9b|\x1b\[)[0-?]*[ -/]*[@-~]").expect("invalid regex"),
            greetings: 0,
            stray_greetings: 0,
            exit_status: None,
        }
    }

    /// Record one line of serial output. Returns the line with
    /// whitespace and escape codes stripped.
    pub fn process_line(&mut self, line: &str) -> String {
        let line = self.ansi_escape.replace_all(line, "");
        let line = line.trim();

        // The greeting must be a line of its own; any other occurrence is
        // output the application was not supposed to produce.
        if line == GREETING {
            self.greetings += 1;
        } else if line.contains(GREETING) {
            self.stray_greetings += line.matches(GREETING).count();
        } else if let Some(status) = line.strip_prefix(STATUS_MARKER) {
            self.exit_status = Some(status.to_string());
        }

        line.to_string()
    }

    /// Check that the application greeted exactly once and exited with
    /// `EFI_SUCCESS`.
    pub fn check(&self) -> Result<()> {
        match self.greetings {
            0 => bail!("the application never printed {GREETING:?}"),
            1 => {}
            n => bail!("the application printed {GREETING:?} {n} times, expected once"),
        }
        if self.stray_greetings > 0 {
            bail!(
                "{GREETING:?} appeared {} more times inside other output",
                self.stray_greetings
            );
        }

        let Some(status) = &self.exit_status else {
            bail!("the application's exit status was not reported");
        };
        let digits = status.strip_prefix("0x").unwrap_or(status);
        match u64::from_str_radix(digits, 16) {
            Ok(0) => Ok(()),
            _ => bail!("the application exited with status {status}"),
        }
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a child process to automatically kill it when dropped.
struct ChildWrapper(Child);

impl Drop for ChildWrapper {
    fn drop(&mut self) {
        // Do nothing if child has already exited (this call doesn't block).
        if matches!(self.0.try_wait(), Ok(Some(_))) {
            return;
        }

        // Try to stop the process, then wait for it to exit. Log errors
        // but otherwise ignore.
        if let Err(err) = self.0.kill() {
            eprintln!("failed to kill process: {err}");
        }
        if let Err(err) = self.0.wait() {
            eprintln!("failed to wait for process exit: {err}");
        }
    }
}

/// Forward lines from `reader` to the returned channel until EOF.
///
/// Bytes that aren't UTF-8 are replaced rather than ending the stream,
/// since firmware writes whatever it likes to the serial port.
fn spawn_line_reader<R: Read + Send + 'static>(reader: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Read serial lines into a transcript until the sender hangs up or the
/// deadline passes.
fn collect_transcript(lines: Receiver<String>, timeout: Duration) -> Result<Transcript> {
    let mut transcript = Transcript::new();
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match lines.recv_timeout(remaining) {
            Ok(line) => {
                let line = transcript.process_line(&line);
                if !line.is_empty() {
                    println!("{line}");
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(transcript),
            Err(RecvTimeoutError::Timeout) => {
                bail!("qemu did not shut down within {}s", timeout.as_secs())
            }
        }
    }
}

/// Build the QEMU command line: the machine shape, the firmware drives,
/// the ESP directory mounted as a FAT drive and the serial console on
/// stdio.
///
/// `ovmf_vars` must be a writable copy, the firmware updates it.
fn qemu_command(
    arch: UefiArch,
    opt: &QemuOpt,
    ovmf_code: &Path,
    ovmf_vars: &Path,
    esp_dir: &Path,
) -> Command {
    let mut cmd = Command::new(arch.qemu_exe());

    if consts::FAMILY == "windows" {
        // The QEMU installer for Windows does not automatically add the
        // directory containing the QEMU executables to the PATH. Append
        // the default directory so QEMU is found there too.
        let mut path = env::var_os("PATH").unwrap_or_default();
        path.push(r";C:\Program Files\qemu");
        cmd.env("PATH", path);
    }

    // Disable default devices.
    // QEMU by defaults enables a ton of devices which slow down boot.
    cmd.arg("-nodefaults");

    // Set the boot menu timeout to zero.
    cmd.args(["-boot", "menu=on,splash-time=0"]);

    // KVM falls back to TCG when it isn't available.
    let accel = if consts::OS == "linux" && !opt.disable_kvm {
        "kvm:tcg"
    } else {
        "tcg"
    };

    match arch {
        UefiArch::AArch64 => {
            cmd.args(["-machine", format!("virt,accel={accel}").as_str()]);

            // A72 is a very generic 64-bit ARM CPU in the wild.
            cmd.args(["-cpu", "cortex-a72"]);
            cmd.args(["-m", "256M"]);
            cmd.args(["-device", "virtio-gpu-pci"]);
        }
        UefiArch::IA32 | UefiArch::X86_64 => {
            cmd.args(["-machine", format!("q35,accel={accel}").as_str()]);
            cmd.args(["-m", "128M"]);
            cmd.args(["-vga", "std"]);
        }
    }

    // Power off instead of looping back into the firmware.
    cmd.arg("-no-reboot");

    add_pflash_args(&mut cmd, ovmf_code, PflashMode::ReadOnly);
    add_pflash_args(&mut cmd, ovmf_vars, PflashMode::ReadWrite);

    // Mount the ESP directory as a FAT partition.
    cmd.arg("-drive");
    let mut drive_arg = OsString::from("format=raw,file=fat:rw:");
    drive_arg.push(esp_dir);
    cmd.arg(drive_arg);

    if opt.headless {
        cmd.args(["-display", "none"]);
    } else {
        cmd.args(["-monitor", "vc:1024x768"]);
    }

    // OVMF connects the UEFI console to the first serial port.
    cmd.args(["-serial", "stdio"]);

    cmd
}

pub fn run_qemu(
    arch: UefiArch,
    opt: &QemuOpt,
    ovmf_paths: &OvmfPaths,
    esp_dir: &Path,
) -> Result<()> {
    let tmp_dir = TempDir::new()?;

    // Make a copy of the OVMF vars file so that it can be used
    // read+write without modifying the original.
    let ovmf_vars = tmp_dir.path().join("ovmf_vars");
    fs_err::copy(&ovmf_paths.vars, &ovmf_vars)?;
    // Necessary, as for example on NixOS, the files are read-only inside
    // the Nix store.
    #[cfg(target_os = "linux")]
    fs_err::set_permissions(&ovmf_vars, Permissions::from_mode(0o666))?;

    let mut cmd = qemu_command(arch, opt, &ovmf_paths.code, &ovmf_vars, esp_dir);
    println!("{}", command_to_string(&cmd));

    if opt.interactive {
        let status = cmd.status().context("failed to launch qemu")?;
        if !status.success() {
            bail!("qemu failed: {status}");
        }
        return Ok(());
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    let mut child = ChildWrapper(cmd.spawn().context("failed to launch qemu")?);
    let stdout = child.0.stdout.take().context("qemu stdout was not captured")?;

    // Capture the result to check it, but first wait for the child to
    // exit.
    let transcript = collect_transcript(
        spawn_line_reader(stdout),
        Duration::from_secs(opt.timeout),
    )?;
    let status = child.0.wait()?;

    let qemu_exit_code = status
        .code()
        .context(format!("qemu was terminated by a signal: {status:?}"))?;
    if qemu_exit_code != 0 {
        bail!("qemu exited with code {qemu_exit_code}");
    }

    transcript.check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opt::{BuildModeOpt, OvmfOpt, TargetOpt};

    fn transcript_of(lines: &[&str]) -> Transcript {
        let mut transcript = Transcript::new();
        for line in lines {
            transcript.process_line(line);
        }
        transcript
    }

    #[test]
    fn test_strips_escape_codes() {
        let mut transcript = Transcript::new();
        assert_eq!(
            transcript.process_line("\x1b[0m\x1b[37m\x1b[40mHello World!\r\n"),
            "Hello World!"
        );
        assert_eq!(transcript.greetings, 1);
    }

    #[test]
    fn test_successful_run() {
        let transcript = transcript_of(&[
            "BdsDxe: starting Boot0001 \"UEFI QEMU HARDDISK\"\r\n",
            "[ INFO]: src/main.rs@014: UEFI 2.70 (EDK II rev 0x10000)\r\n",
            "Hello World!\r\n",
            "HELLO_EFI_STATUS=0x0\r\n",
        ]);
        transcript.check().unwrap();
    }

    #[test]
    fn test_greeting_twice_on_one_line() {
        let transcript = transcript_of(&["Hello World!Hello World!\r\n", "HELLO_EFI_STATUS=0x0"]);
        let err = transcript.check().unwrap_err();
        assert!(err.to_string().contains("never printed"));

        let transcript = transcript_of(&[
            "Hello World!",
            "Hello World!Hello World!",
            "HELLO_EFI_STATUS=0x0",
        ]);
        let err = transcript.check().unwrap_err();
        assert!(err.to_string().contains("2 more times"));
    }

    #[test]
    fn test_greeting_inside_other_output() {
        let transcript = transcript_of(&["[ WARN]: failed: Hello World!", "HELLO_EFI_STATUS=0x0"]);
        assert!(transcript.check().is_err());

        let transcript = transcript_of(&[
            "Hello World!",
            "[ WARN]: failed: Hello World!",
            "HELLO_EFI_STATUS=0x0",
        ]);
        assert!(transcript.check().is_err());
    }

    #[test]
    fn test_missing_greeting() {
        let transcript = transcript_of(&["HELLO_EFI_STATUS=0x0"]);
        assert!(transcript.check().is_err());
    }

    #[test]
    fn test_repeated_greeting() {
        let transcript = transcript_of(&["Hello World!", "Hello World!", "HELLO_EFI_STATUS=0"]);
        let err = transcript.check().unwrap_err();
        assert!(err.to_string().contains("2 times"));
    }

    #[test]
    fn test_failed_status() {
        let transcript = transcript_of(&["Hello World!", "HELLO_EFI_STATUS=0x8000000000000003"]);
        assert!(transcript.check().is_err());

        let transcript = transcript_of(&["Hello World!"]);
        assert!(transcript.check().is_err());
    }

    #[test]
    fn test_collect_transcript_until_hangup() {
        let (tx, rx) = mpsc::channel();
        tx.send("Hello World!\n".to_string()).unwrap();
        tx.send("HELLO_EFI_STATUS=0x0\n".to_string()).unwrap();
        drop(tx);

        let transcript = collect_transcript(rx, Duration::from_secs(5)).unwrap();
        transcript.check().unwrap();
    }

    #[test]
    fn test_collect_transcript_timeout() {
        let (tx, rx) = mpsc::channel::<String>();
        let res = collect_transcript(rx, Duration::from_millis(10));
        drop(tx);
        assert!(res.is_err());
    }

    #[test]
    fn test_line_reader() {
        let input: &[u8] = b"one\r\ntwo\xff\nthree";
        let lines: Vec<_> = spawn_line_reader(input).iter().collect();
        assert_eq!(lines, ["one\r\n", "two\u{fffd}\n", "three"]);
    }

    fn qemu_opt(target: UefiArch, disable_kvm: bool, headless: bool) -> QemuOpt {
        QemuOpt {
            target: TargetOpt { target },
            build_mode: BuildModeOpt { release: false },
            ovmf: OvmfOpt::default(),
            disable_kvm,
            headless,
            interactive: false,
            timeout: 120,
        }
    }

    fn command_line(opt: &QemuOpt) -> String {
        command_to_string(&qemu_command(
            *opt.target,
            opt,
            Path::new("code.fd"),
            Path::new("vars.fd"),
            Path::new("esp"),
        ))
    }

    #[test]
    fn test_x86_64_command() {
        let accel = if consts::OS == "linux" { "kvm:tcg" } else { "tcg" };
        assert_eq!(
            command_line(&qemu_opt(UefiArch::X86_64, false, false)),
            format!(
                "qemu-system-x86_64 -nodefaults -boot menu=on,splash-time=0 \
                 -machine q35,accel={accel} -m 128M -vga std -no-reboot \
                 -drive if=pflash,format=raw,readonly=on,file=code.fd \
                 -drive if=pflash,format=raw,readonly=off,file=vars.fd \
                 -drive format=raw,file=fat:rw:esp \
                 -monitor vc:1024x768 -serial stdio"
            )
        );
    }

    #[test]
    fn test_aarch64_headless_command() {
        assert_eq!(
            command_line(&qemu_opt(UefiArch::AArch64, true, true)),
            "qemu-system-aarch64 -nodefaults -boot menu=on,splash-time=0 \
             -machine virt,accel=tcg -cpu cortex-a72 -m 256M -device virtio-gpu-pci -no-reboot \
             -drive if=pflash,format=raw,readonly=on,file=code.fd \
             -drive if=pflash,format=raw,readonly=off,file=vars.fd \
             -drive format=raw,file=fat:rw:esp \
             -display none -serial stdio"
        );
    }
}
