use tracing::{info, warn};

use crate::capture::Resolution;

/// Smallest offered resolution that covers the request in both dimensions.
///
/// Falls back to the requested size unchanged when nothing qualifies or the
/// source reports no sizes at all.
pub fn choose_stream_resolution(requested: Resolution, available: &[Resolution]) -> Resolution {
    for (i, res) in available.iter().enumerate() {
        info!("Resolution {}: {}", i, res);
    }

    let best = available
        .iter()
        .filter(|res| res.width >= requested.width && res.height >= requested.height)
        .min_by_key(|res| res.area());

    match best {
        Some(res) => {
            info!("Selected stream {} for requested {}", res, requested);
            *res
        }
        None => {
            warn!(
                "No offered resolution covers {}; falling back to requested size",
                requested
            );
            requested
        }
    }
}

#[cfg(feature = "v4l2")]
pub use detect::{auto_detect_device, FoundDevice, NoDevice};

#[cfg(feature = "v4l2")]
mod detect {
    use std::path::Path;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::PixelFormat;

    #[derive(Debug, Error)]
    #[error("no suitable capture device found")]
    pub struct NoDevice;

    // Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    /// Auto-detect best capture device
    pub fn auto_detect_device() -> Result<FoundDevice, NoDevice> {
        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            // Prefer raw NV12, then YUYV, then MJPEG
            let Ok(formats) = dev.enum_formats() else {
                continue;
            };
            let preference = [
                (FourCC::new(b"NV12"), PixelFormat::Nv12),
                (FourCC::new(b"YUYV"), PixelFormat::Yuyv4),
                (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
            ];
            for (fourcc, format) in preference {
                if formats.iter().any(|fmt| fmt.fourcc == fourcc) {
                    info!("Found {:?} device: {} - {}", format, path, caps.card);
                    return Ok(FoundDevice { path, format });
                }
            }
        }

        Err(NoDevice)
    }
}
