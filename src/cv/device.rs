//! V4L2 capture-device access: enumeration with a capability probe (filters
//! metadata-only nodes), format negotiation, and frame reads.
//!
//! Talks to the kernel directly through the V4L2 ioctls; the read() I/O path
//! is used for frames.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use libc::{c_ulong, ioctl};
use tracing::{debug, info};

// ioctl number builders (matching _IOR/_IOWR in C).
const fn ior(ty: u8, nr: u8, size: usize) -> c_ulong {
    ((2u64 << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)) as c_ulong
}
const fn iowr(ty: u8, nr: u8, size: usize) -> c_ulong {
    ((3u64 << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)) as c_ulong
}

#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
struct V4l2FmtDesc {
    index: u32,
    type_: u32,
    flags: u32,
    description: [u8; 32],
    pixelformat: u32,
    mbus_code: u32,
    reserved: [u32; 3],
}

/// The pix-format member of the v4l2_format union.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    priv_: u32,
    flags: u32,
    enc: u32,
    quantization: u32,
    xfer_func: u32,
}

/// struct v4l2_format: a type tag plus a 200-byte union, 8-aligned.
#[repr(C, align(8))]
struct V4l2Format {
    type_: u32,
    _pad: u32,
    fmt: [u8; 200],
}

const VIDIOC_QUERYCAP: c_ulong = ior(b'V', 0, size_of::<V4l2Capability>());
const VIDIOC_ENUM_FMT: c_ulong = iowr(b'V', 2, size_of::<V4l2FmtDesc>());
const VIDIOC_G_FMT: c_ulong = iowr(b'V', 4, size_of::<V4l2Format>());
const VIDIOC_S_FMT: c_ulong = iowr(b'V', 5, size_of::<V4l2Format>());

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;

pub const FOURCC_YUYV: u32 = u32::from_le_bytes(*b"YUYV");
pub const FOURCC_MJPG: u32 = u32::from_le_bytes(*b"MJPG");

pub fn fourcc_name(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn cstr_field(buf: &[u8]) -> String {
    let nul = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).into_owned()
}

/// A discovered capture-capable device node.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub path: PathBuf,
    pub index: u32,
    pub name: String,
}

/// An opened video node.
pub struct VideoDevice {
    file: File,
    path: PathBuf,
}

impl VideoDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(VideoDevice { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_capability(&self) -> io::Result<(String, u32)> {
        let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
        // SAFETY: valid fd, zeroed struct of the advertised size.
        let res = unsafe { ioctl(self.file.as_raw_fd(), VIDIOC_QUERYCAP, &mut cap) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        let caps = if cap.device_caps != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        Ok((cstr_field(&cap.card), caps))
    }

    pub fn card_name(&self) -> io::Result<String> {
        self.query_capability().map(|(name, _)| name)
    }

    pub fn is_capture_capable(&self) -> bool {
        self.query_capability()
            .map(|(_, caps)| caps & V4L2_CAP_VIDEO_CAPTURE != 0)
            .unwrap_or(false)
    }

    /// A metadata-only node enumerates zero capture formats.
    pub fn has_capture_formats(&self) -> bool {
        let mut desc: V4l2FmtDesc = unsafe { std::mem::zeroed() };
        desc.index = 0;
        desc.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        // SAFETY: valid fd, struct of the advertised size.
        let res = unsafe { ioctl(self.file.as_raw_fd(), VIDIOC_ENUM_FMT, &mut desc) };
        res == 0
    }

    fn format_ioctl(&self, request: c_ulong, pix: PixFormat) -> io::Result<PixFormat> {
        let mut format = V4l2Format {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            _pad: 0,
            fmt: [0u8; 200],
        };
        // SAFETY: PixFormat fits inside the 200-byte union.
        unsafe {
            std::ptr::write_unaligned(format.fmt.as_mut_ptr() as *mut PixFormat, pix);
        }
        // SAFETY: valid fd, struct of the advertised size.
        let res = unsafe { ioctl(self.file.as_raw_fd(), request, &mut format) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel filled the union's pix member.
        Ok(unsafe { std::ptr::read_unaligned(format.fmt.as_ptr() as *const PixFormat) })
    }

    /// Negotiate a format; the driver may adjust width/height/pixelformat.
    pub fn set_format(&self, width: u32, height: u32, fourcc: u32) -> io::Result<PixFormat> {
        let pix = PixFormat {
            width,
            height,
            pixelformat: fourcc,
            field: V4L2_FIELD_NONE,
            ..PixFormat::default()
        };
        let granted = self.format_ioctl(VIDIOC_S_FMT, pix)?;
        debug!(
            path = %self.path.display(),
            requested = %fourcc_name(fourcc),
            granted = %fourcc_name(granted.pixelformat),
            width = granted.width,
            height = granted.height,
            "format negotiated"
        );
        Ok(granted)
    }

    pub fn current_format(&self) -> io::Result<PixFormat> {
        self.format_ioctl(VIDIOC_G_FMT, PixFormat::default())
    }

    /// Blocking read of one frame into `buf` (resized to `sizeimage`).
    /// Returns the byte count actually delivered.
    pub fn read_frame(&mut self, buf: &mut Vec<u8>, sizeimage: usize) -> io::Result<usize> {
        buf.resize(sizeimage.max(1), 0);
        loop {
            // SAFETY: valid fd, pointer into a live buffer of the given length.
            let res = unsafe {
                libc::read(
                    self.file.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            match res {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                0 => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "video device delivered no data",
                    ))
                }
                n => return Ok(n as usize),
            }
        }
    }
}

/// All capture-capable `/dev/video*` nodes, sorted by node number.
pub fn list_video_devices() -> Vec<CaptureDevice> {
    let mut nodes: Vec<(PathBuf, u32)> = match fs::read_dir("/dev") {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let file_name = path.file_name()?.to_str()?.to_string();
                let index = file_name.strip_prefix("video")?.parse::<u32>().ok()?;
                Some((path, index))
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    nodes.sort_by_key(|(_, n)| *n);

    let mut devices = Vec::new();
    for (path, index) in nodes {
        let Ok(dev) = VideoDevice::open(&path) else {
            continue;
        };
        if !dev.is_capture_capable() || !dev.has_capture_formats() {
            debug!(path = %path.display(), "skipping non-capture video node");
            continue;
        }
        let name = dev
            .card_name()
            .unwrap_or_else(|_| format!("Video Device {index}"));
        devices.push(CaptureDevice { path, index, name });
    }
    devices
}

/// Does this device match the operator's `KEYBRIDGE_CV_DEVICE` preference
/// (numeric index, /dev path, or name substring)?
pub fn matches_preference(device: &CaptureDevice, pref: &str) -> bool {
    if pref.is_empty() {
        return false;
    }
    if let Ok(index) = pref.parse::<u32>() {
        return device.index == index;
    }
    if pref.starts_with("/dev/") {
        return device.path == Path::new(pref);
    }
    device.name.to_lowercase().contains(&pref.to_lowercase())
}

/// Candidate order: env preference first, then HDMI/capture-named devices,
/// then the rest by node number.
pub fn ordered_candidates(preference: Option<&str>) -> Vec<CaptureDevice> {
    let mut devices = list_video_devices();
    devices.sort_by_key(|d| {
        let name = d.name.to_lowercase();
        let keyword = if name.contains("hdmi") || name.contains("capture") {
            0
        } else {
            1
        };
        (keyword, d.index)
    });
    if let Some(pref) = preference {
        devices.sort_by_key(|d| if matches_preference(d, pref) { 0 } else { 1 });
    }
    devices
}

/// Retry discovery with exponential backoff until a device appears or the
/// attempt budget runs out.
pub async fn find_capture_device_with_retry(
    max_retries: u32,
    preference: Option<&str>,
) -> Option<CaptureDevice> {
    let mut delay = std::time::Duration::from_secs(1);
    const MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    for attempt in 0..max_retries.max(1) {
        if let Some(first) = ordered_candidates(preference).into_iter().next() {
            info!(path = %first.path.display(), name = %first.name, "capture device found");
            return Some(first);
        }
        if attempt + 1 < max_retries {
            info!(attempt = attempt + 1, wait_s = delay.as_secs(), "no capture device yet");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_DELAY);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        assert_eq!(fourcc_name(FOURCC_YUYV), "YUYV");
        assert_eq!(fourcc_name(FOURCC_MJPG), "MJPG");
    }

    #[test]
    fn preference_matching() {
        let dev = CaptureDevice {
            path: PathBuf::from("/dev/video2"),
            index: 2,
            name: "USB3 HDMI Capture".into(),
        };
        assert!(matches_preference(&dev, "2"));
        assert!(!matches_preference(&dev, "3"));
        assert!(matches_preference(&dev, "/dev/video2"));
        assert!(matches_preference(&dev, "hdmi"));
        assert!(!matches_preference(&dev, "webcam"));
        assert!(!matches_preference(&dev, ""));
    }

    #[test]
    fn struct_sizes_match_the_abi() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2FmtDesc>(), 64);
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<PixFormat>(), 48);
    }
}
