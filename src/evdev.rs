//! Raw evdev device access: open, exclusive grab, non-blocking event reads,
//! and keyboard discovery.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use input_linux_sys::{input_event, EV_KEY, EV_MAX};
use libc::{c_ulong, ioctl};
use tracing::{debug, warn};

// ioctl number builders (matching _IOR/_IOW in C).
const fn ior(ty: u8, nr: u8, size: usize) -> c_ulong {
    ((2u64 << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)) as c_ulong
}
const fn iow(ty: u8, nr: u8, size: usize) -> c_ulong {
    ((1u64 << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)) as c_ulong
}

const EVIOCGNAME_LEN: usize = 256;
const EVIOCGNAME_IOCTL: c_ulong = ior(b'E', 0x06, EVIOCGNAME_LEN);
const EVIOCGRAB_IOCTL: c_ulong = iow(b'E', 0x90, size_of::<libc::c_int>());

fn eviocgbit_ioctl(ev_type: u8, len: usize) -> c_ulong {
    ior(b'E', 0x20 + ev_type, len)
}

fn eviocgname(fd: RawFd) -> io::Result<String> {
    let mut buf = [0u8; EVIOCGNAME_LEN];
    // SAFETY: valid fd, buffer of the advertised length.
    let res = unsafe { ioctl(fd, EVIOCGNAME_IOCTL, buf.as_mut_ptr()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    let nul = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..nul]).to_string())
}

fn eviocgbit(fd: RawFd, ev_type: u8, buf: &mut [u8]) -> io::Result<()> {
    let num = eviocgbit_ioctl(ev_type, buf.len());
    // SAFETY: valid fd, buffer sized by the caller.
    let res = unsafe { ioctl(fd, num, buf.as_mut_ptr()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[inline]
fn is_bit_set(buf: &[u8], bit: usize) -> bool {
    buf.get(bit / 8).map_or(false, |b| b & (1 << (bit % 8)) != 0)
}

/// An opened evdev input device (non-blocking).
pub struct InputDevice {
    file: File,
    path: PathBuf,
    grabbed: bool,
}

impl InputDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(InputDevice {
            file,
            path,
            grabbed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        eviocgname(self.file.as_raw_fd()).unwrap_or_else(|_| "<unknown>".to_string())
    }

    /// Take the exclusive grab so events stop reaching the rest of the OS.
    pub fn grab(&mut self) -> io::Result<()> {
        // SAFETY: EVIOCGRAB with the documented int argument.
        let res = unsafe { ioctl(self.file.as_raw_fd(), EVIOCGRAB_IOCTL, 1 as libc::c_int) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.grabbed = true;
        debug!(path = %self.path.display(), "input device grabbed");
        Ok(())
    }

    pub fn ungrab(&mut self) {
        if !self.grabbed {
            return;
        }
        // SAFETY: releasing the grab; failure only means it was already gone.
        let res = unsafe { ioctl(self.file.as_raw_fd(), EVIOCGRAB_IOCTL, 0 as libc::c_int) };
        if res < 0 {
            warn!(path = %self.path.display(), "EVIOCGRAB release failed");
        }
        self.grabbed = false;
    }

    /// Read one `input_event`. Returns `WouldBlock` when no event is queued
    /// (the fd is non-blocking) so async callers can clear readiness.
    pub fn read_event(&self) -> io::Result<input_event> {
        let mut buf = [0u8; size_of::<input_event>()];
        let mut filled = 0usize;
        while filled < buf.len() {
            // SAFETY: valid fd, pointer into a live buffer with the exact
            // remaining length.
            let res = unsafe {
                libc::read(
                    self.file.as_raw_fd(),
                    buf.as_mut_ptr().add(filled) as *mut libc::c_void,
                    buf.len() - filled,
                )
            };
            match res {
                -1 => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        ErrorKind::Interrupted => continue,
                        // Partial event followed by EAGAIN should not happen
                        // for evdev (events are atomic), but retrying the
                        // remainder would spin; surface it either way.
                        _ => return Err(err),
                    }
                }
                0 => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "input device closed",
                    ))
                }
                n => filled += n as usize,
            }
        }
        // SAFETY: buffer holds exactly one kernel-written input_event.
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const input_event) })
    }
}

impl AsRawFd for InputDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        self.ungrab();
    }
}

/// Event timestamp in seconds (kernel timeval).
#[inline]
pub fn event_seconds(ev: &input_event) -> f64 {
    ev.time.tv_sec as f64 + ev.time.tv_usec as f64 / 1_000_000.0
}

#[inline]
pub fn is_key_event(ev: &input_event) -> bool {
    i32::from(ev.type_) == EV_KEY
}

fn has_key_capability(fd: RawFd) -> bool {
    let size = (EV_MAX / 8) + 1;
    let mut bits = vec![0u8; size as usize];
    if eviocgbit(fd, 0, &mut bits).is_err() {
        return false;
    }
    is_bit_set(&bits, EV_KEY as usize)
}

/// All `/dev/input/event*` nodes with EV_KEY capability, with their names,
/// sorted by node number.
pub fn list_keyboard_devices() -> io::Result<Vec<(PathBuf, String)>> {
    let mut nodes: Vec<(PathBuf, u64)> = fs::read_dir("/dev/input")?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let file_name = path.file_name()?.to_str()?.to_string();
            let num = file_name.strip_prefix("event")?.parse::<u64>().ok()?;
            Some((path, num))
        })
        .collect();
    nodes.sort_by_key(|(_, n)| *n);

    let mut out = Vec::new();
    for (path, _) in nodes {
        let Ok(dev) = InputDevice::open(&path) else {
            continue;
        };
        if has_key_capability(dev.as_raw_fd()) {
            out.push((path, dev.name()));
        }
    }
    Ok(out)
}

/// Locate the keyboard to bridge: friendly by-id symlinks first, then the
/// first EV_KEY-capable event node.
pub fn find_keyboard() -> Option<PathBuf> {
    if let Ok(entries) = fs::read_dir("/dev/input/by-id") {
        let mut links: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with("-event-kbd"))
                    .unwrap_or(false)
            })
            .collect();
        links.sort();
        if let Some(first) = links.into_iter().next() {
            return Some(first);
        }
    }
    list_keyboard_devices()
        .ok()
        .and_then(|v| v.into_iter().next())
        .map(|(p, _)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_linux_sys::timeval;

    #[test]
    fn timestamp_conversion() {
        let ev = input_event {
            time: timeval {
                tv_sec: 12,
                tv_usec: 500_000,
            },
            type_: EV_KEY as u16,
            code: 30,
            value: 1,
        };
        assert!((event_seconds(&ev) - 12.5).abs() < 1e-9);
        assert!(is_key_event(&ev));
    }

    #[test]
    fn bit_probe_helper() {
        let buf = [0b0000_0010u8, 0b0000_0001];
        assert!(is_bit_set(&buf, 1));
        assert!(is_bit_set(&buf, 8));
        assert!(!is_bit_set(&buf, 0));
        assert!(!is_bit_set(&buf, 63));
    }
}
