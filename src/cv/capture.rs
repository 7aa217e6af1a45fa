//! HDMI capture: device selection, format ladder, a dedicated grabber
//! thread publishing JPEG frames to the [`FrameSlot`], and a reconnect
//! monitor.
//!
//! The grabber runs at 2 fps: read → convert (YUYV or MJPG) → encode JPEG →
//! publish. A read failure marks the capture disconnected and the monitor
//! retries the full open sequence on an exponential schedule.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{
    self, CaptureDevice, PixFormat, VideoDevice, FOURCC_MJPG, FOURCC_YUYV,
};
use super::frame::{FrameMeta, FrameSlot};
use crate::error::{Error, Result};
use crate::util;

/// Grabber cadence.
const FRAME_INTERVAL: Duration = Duration::from_millis(500);
/// Pause after a failed read before the grabber gives up the device.
const READ_FAILURE_BACKOFF: Duration = Duration::from_millis(500);
const TARGET_WIDTH: u32 = 1280;
const TARGET_HEIGHT: u32 = 720;

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub connected: bool,
    pub capturing: bool,
    pub has_frame: bool,
    pub frames_captured: u64,
    pub frames_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub path: String,
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameStatus {
    pub width: u32,
    pub height: u32,
    pub timestamp: f64,
    pub age_seconds: f64,
    pub size_bytes: usize,
}

struct SharedState {
    running: AtomicBool,
    stop: AtomicBool,
    connected: AtomicBool,
    frames_captured: AtomicU64,
    frames_failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    device: Mutex<Option<CaptureDevice>>,
}

impl SharedState {
    fn set_error(&self, msg: impl Into<String>) {
        let mut slot = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(msg.into());
    }
    fn clear_error(&self) {
        let mut slot = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }
}

pub struct CvCapture {
    jpeg_quality: u8,
    preference: Option<String>,
    slot: Arc<FrameSlot>,
    shared: Arc<SharedState>,
    grabber: Mutex<Option<std::thread::JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CvCapture {
    pub fn new(jpeg_quality: u8, preference: Option<String>) -> Self {
        CvCapture {
            jpeg_quality,
            preference,
            slot: Arc::new(FrameSlot::new()),
            shared: Arc::new(SharedState {
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                frames_failed: AtomicU64::new(0),
                last_error: Mutex::new(None),
                device: Mutex::new(None),
            }),
            grabber: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.slot)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Find a device, negotiate a format, start the grabber thread and the
    /// reconnect monitor.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            warn!("capture already running");
            return Ok(());
        }
        self.shared.clear_error();
        self.shared.stop.store(false, Ordering::SeqCst);

        let preference = self.preference.clone();
        if device::find_capture_device_with_retry(3, preference.as_deref())
            .await
            .is_none()
        {
            self.shared.set_error("no capture device found after retries");
            return Err(Error::state("no capture device found after retries"));
        }

        self.open_and_spawn().await?;
        self.shared.running.store(true, Ordering::SeqCst);

        // Reconnect monitor.
        let shared = Arc::clone(&self.shared);
        let slot = Arc::clone(&self.slot);
        let quality = self.jpeg_quality;
        let pref = self.preference.clone();
        let handle = tokio::spawn(async move {
            monitor_loop(shared, slot, quality, pref).await;
        });
        let mut guard = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(handle);
        info!("capture started");
        Ok(())
    }

    async fn open_and_spawn(&self) -> Result<()> {
        let preference = self.preference.clone();
        let opened = tokio::task::spawn_blocking(move || open_best_device(preference.as_deref()))
            .await
            .map_err(|e| Error::state(format!("capture init task failed: {e}")))??;

        let (dev, pix, info) = opened;
        {
            let mut guard = self.shared.device.lock().unwrap_or_else(|p| p.into_inner());
            *guard = Some(info);
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        spawn_grabber(
            dev,
            pix,
            self.jpeg_quality,
            Arc::clone(&self.slot),
            Arc::clone(&self.shared),
            &self.grabber,
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("stopping capture");
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);

        let monitor = {
            let mut guard = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(handle) = monitor {
            handle.abort();
        }
        let grabber = {
            let mut guard = self.grabber.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(handle) = grabber {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> CaptureStatus {
        let latest = self.slot.latest();
        let device = {
            let guard = self.shared.device.lock().unwrap_or_else(|p| p.into_inner());
            guard.as_ref().map(|d| DeviceStatus {
                path: d.path.to_string_lossy().into_owned(),
                index: d.index,
                name: d.name.clone(),
            })
        };
        let last_error = {
            let guard = self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        CaptureStatus {
            connected: self.shared.connected.load(Ordering::SeqCst),
            capturing: self.is_running(),
            has_frame: latest.is_some(),
            frames_captured: self.shared.frames_captured.load(Ordering::SeqCst),
            frames_failed: self.shared.frames_failed.load(Ordering::SeqCst),
            last_error,
            device,
            frame: latest.map(|(_, meta)| FrameStatus {
                width: meta.width,
                height: meta.height,
                timestamp: meta.timestamp,
                age_seconds: (util::unix_ts() - meta.timestamp).max(0.0),
                size_bytes: meta.size_bytes,
            }),
        }
    }
}

type OpenedDevice = (VideoDevice, PixFormat, CaptureDevice);

/// Try every candidate: open, negotiate a format, read one probe frame.
fn open_best_device(preference: Option<&str>) -> Result<OpenedDevice> {
    let candidates = device::ordered_candidates(preference);
    if candidates.is_empty() {
        return Err(Error::state("no capture devices detected on system"));
    }
    let mut last_err = String::from("no candidate device opened");
    for candidate in candidates {
        match try_open(&candidate) {
            Ok((dev, pix)) => return Ok((dev, pix, candidate)),
            Err(e) => {
                warn!(path = %candidate.path.display(), error = %e, "candidate failed");
                last_err = e.to_string();
            }
        }
    }
    Err(Error::state(last_err))
}

/// Format ladder: YUYV, then MJPG, then whatever the device already has.
/// One probe frame per format before committing.
fn try_open(candidate: &CaptureDevice) -> Result<(VideoDevice, PixFormat)> {
    let mut dev = VideoDevice::open(&candidate.path)?;
    let mut buf = Vec::new();

    for &fourcc in &[FOURCC_YUYV, FOURCC_MJPG] {
        match dev.set_format(TARGET_WIDTH, TARGET_HEIGHT, fourcc) {
            Ok(pix) if pix.pixelformat == fourcc => {
                if dev.read_frame(&mut buf, pix.sizeimage as usize).is_ok() {
                    info!(
                        path = %candidate.path.display(),
                        format = %device::fourcc_name(fourcc),
                        "probe frame read, committing format"
                    );
                    return Ok((dev, pix));
                }
            }
            Ok(_) | Err(_) => {}
        }
    }

    // Device default.
    let pix = dev.current_format()?;
    dev.read_frame(&mut buf, pix.sizeimage as usize)?;
    info!(
        path = %candidate.path.display(),
        format = %device::fourcc_name(pix.pixelformat),
        "falling back to device-default format"
    );
    Ok((dev, pix))
}

fn spawn_grabber(
    mut dev: VideoDevice,
    pix: PixFormat,
    quality: u8,
    slot: Arc<FrameSlot>,
    shared: Arc<SharedState>,
    out: &Mutex<Option<std::thread::JoinHandle<()>>>,
) {
    let shared_thread = shared.clone();
    let handle = std::thread::Builder::new()
        .name("cv-grabber".into())
        .spawn(move || {
            grabber_loop(&mut dev, pix, quality, &slot, &shared_thread);
        });
    match handle {
        Ok(h) => {
            let mut guard = out.lock().unwrap_or_else(|p| p.into_inner());
            *guard = Some(h);
        }
        Err(e) => {
            shared.set_error(format!("cannot spawn grabber thread: {e}"));
            shared.connected.store(false, Ordering::SeqCst);
        }
    }
}

fn grabber_loop(
    dev: &mut VideoDevice,
    pix: PixFormat,
    quality: u8,
    slot: &FrameSlot,
    shared: &SharedState,
) {
    debug!(path = %dev.path().display(), "grabber thread started");
    let mut raw = Vec::new();
    while !shared.stop.load(Ordering::SeqCst) {
        match dev.read_frame(&mut raw, pix.sizeimage as usize) {
            Ok(n) => match decode_frame(&raw[..n], &pix) {
                Some(rgb) => match encode_jpeg(&rgb, quality) {
                    Ok(jpeg) => {
                        shared.frames_captured.fetch_add(1, Ordering::SeqCst);
                        slot.update(
                            jpeg,
                            FrameMeta {
                                timestamp: util::unix_ts(),
                                width: rgb.width(),
                                height: rgb.height(),
                                size_bytes: 0,
                                region: None,
                            },
                        );
                    }
                    Err(e) => {
                        shared.frames_failed.fetch_add(1, Ordering::SeqCst);
                        warn!(error = %e, "JPEG encode failed");
                    }
                },
                None => {
                    shared.frames_failed.fetch_add(1, Ordering::SeqCst);
                }
            },
            Err(e) => {
                shared.frames_failed.fetch_add(1, Ordering::SeqCst);
                shared.set_error(format!("frame read failed: {e}"));
                shared.connected.store(false, Ordering::SeqCst);
                warn!(error = %e, "frame read failed, grabber yielding device");
                std::thread::sleep(READ_FAILURE_BACKOFF);
                break;
            }
        }
        std::thread::sleep(FRAME_INTERVAL);
    }
    debug!("grabber thread exiting");
}

/// Rebuild the capture path after the grabber lost the device.
async fn monitor_loop(
    shared: Arc<SharedState>,
    slot: Arc<FrameSlot>,
    quality: u8,
    preference: Option<String>,
) {
    let mut delay = Duration::from_secs(1);
    const MAX_DELAY: Duration = Duration::from_secs(30);
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        if shared.connected.load(Ordering::SeqCst) {
            delay = Duration::from_secs(1);
            continue;
        }
        info!(wait_s = delay.as_secs(), "capture disconnected, attempting reopen");
        let pref = preference.clone();
        let opened =
            tokio::task::spawn_blocking(move || open_best_device(pref.as_deref())).await;
        match opened {
            Ok(Ok((dev, pix, info))) => {
                {
                    let mut guard = shared.device.lock().unwrap_or_else(|p| p.into_inner());
                    *guard = Some(info);
                }
                shared.clear_error();
                shared.connected.store(true, Ordering::SeqCst);
                let holder = Mutex::new(None);
                spawn_grabber(dev, pix, quality, Arc::clone(&slot), Arc::clone(&shared), &holder);
                // The rebuilt grabber is detached; stop() still reaches it
                // through the shared stop flag.
                delay = Duration::from_secs(1);
            }
            Ok(Err(e)) => {
                shared.set_error(e.to_string());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) => {
                shared.set_error(format!("reopen task failed: {e}"));
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

fn decode_frame(raw: &[u8], pix: &PixFormat) -> Option<RgbImage> {
    match pix.pixelformat {
        f if f == FOURCC_YUYV => yuyv_to_rgb(raw, pix.width, pix.height),
        f if f == FOURCC_MJPG => image::load_from_memory(raw).ok().map(|d| d.to_rgb8()),
        _ => {
            // Unknown raw format: try the generic decoder.
            image::load_from_memory(raw).ok().map(|d| d.to_rgb8())
        }
    }
}

/// Packed YUYV 4:2:2 → RGB (BT.601).
pub fn yuyv_to_rgb(raw: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let expected = (width as usize) * (height as usize) * 2;
    if raw.len() < expected || width % 2 != 0 {
        return None;
    }
    let mut img = RgbImage::new(width, height);
    let clamp = |v: i32| v.clamp(0, 255) as u8;
    for y in 0..height as usize {
        for pair in 0..(width as usize / 2) {
            let base = y * width as usize * 2 + pair * 4;
            let (y0, u, y1, v) = (
                raw[base] as i32,
                raw[base + 1] as i32,
                raw[base + 2] as i32,
                raw[base + 3] as i32,
            );
            let (d, e) = (u - 128, v - 128);
            for (i, yy) in [(0usize, y0), (1usize, y1)] {
                let c = (yy - 16).max(0) * 298;
                let r = clamp((c + 409 * e + 128) >> 8);
                let g = clamp((c - 100 * d - 208 * e + 128) >> 8);
                let b = clamp((c + 516 * d + 128) >> 8);
                img.put_pixel((pair * 2 + i) as u32, y as u32, image::Rgb([r, g, b]));
            }
        }
    }
    Some(img)
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| Error::state(format!("JPEG encode failed: {e}")))?;
    Ok(out)
}
