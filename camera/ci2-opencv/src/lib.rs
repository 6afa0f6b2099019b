use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, warn};

use ci2::{FrameWithInfo, HostTimingInfo};

/// Number of device indices tried when listing cameras.
const N_SCANNED_DEVICES: i32 = 4;

trait ExtendedError<T> {
    fn map_cv_err(self) -> ci2::Result<T>;
}

impl<T> ExtendedError<T> for opencv::Result<T> {
    fn map_cv_err(self) -> ci2::Result<T> {
        self.map_err(|e| ci2::Error::BackendError(Box::new(e)))
    }
}

#[derive(Clone)]
pub struct WrappedModule {}

pub fn new_module() -> ci2::Result<WrappedModule> {
    Ok(WrappedModule {})
}

fn parse_index(name: &str) -> ci2::Result<i32> {
    name.trim()
        .parse()
        .map_err(|_| ci2::Error::CameraNotFound(name.to_string()))
}

fn open_capture(index: i32) -> ci2::Result<Option<VideoCapture>> {
    let cap = VideoCapture::new(index, videoio::CAP_ANY).map_cv_err()?;
    if cap.is_opened().map_cv_err()? {
        Ok(Some(cap))
    } else {
        Ok(None)
    }
}

fn info_for(index: i32, cap: &VideoCapture) -> OpenCvCameraInfo {
    let model = cap
        .get_backend_name()
        .unwrap_or_else(|_| "unknown".to_string());
    OpenCvCameraInfo {
        name: index.to_string(),
        serial: index.to_string(),
        model,
        vendor: "OpenCV".to_string(),
    }
}

impl ci2::CameraModule for WrappedModule {
    type CameraType = WrappedCamera;

    fn name(&self) -> &str {
        "opencv"
    }

    fn camera_infos(&self) -> ci2::Result<Vec<Box<dyn ci2::CameraInfo>>> {
        let mut infos = Vec::new();
        for index in 0..N_SCANNED_DEVICES {
            if let Some(mut cap) = open_capture(index)? {
                let ci: Box<dyn ci2::CameraInfo> = Box::new(info_for(index, &cap));
                infos.push(ci);
                cap.release().map_cv_err()?;
            }
        }
        Ok(infos)
    }

    /// Open the video device with the given index (e.g. "0").
    fn camera(&mut self, name: &str) -> ci2::Result<Self::CameraType> {
        let index = parse_index(name)?;
        let cap =
            open_capture(index)?.ok_or_else(|| ci2::Error::CameraNotFound(name.to_string()))?;
        let info = info_for(index, &cap);
        debug!("opened video device {index} with {} backend", info.model);
        Ok(WrappedCamera {
            cap,
            info,
            acquisition_started: false,
            frame: Mat::default(),
            store_fno: 0,
        })
    }
}

#[derive(Debug)]
pub struct OpenCvCameraInfo {
    name: String,
    serial: String,
    model: String,
    vendor: String,
}

impl ci2::CameraInfo for OpenCvCameraInfo {
    fn name(&self) -> &str {
        &self.name
    }
    fn serial(&self) -> &str {
        &self.serial
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn vendor(&self) -> &str {
        &self.vendor
    }
}

pub struct WrappedCamera {
    cap: VideoCapture,
    pub info: OpenCvCameraInfo,
    acquisition_started: bool,
    frame: Mat,
    store_fno: usize,
}

impl ci2::CameraInfo for WrappedCamera {
    fn name(&self) -> &str {
        self.info.name()
    }
    fn serial(&self) -> &str {
        self.info.serial()
    }
    fn model(&self) -> &str {
        self.info.model()
    }
    fn vendor(&self) -> &str {
        self.info.vendor()
    }
}

/// Convert a frame as delivered by `VideoCapture` to RGB8.
fn mat_to_rgb_image(frame: &Mat) -> ci2::Result<image::RgbImage> {
    let code = match frame.channels() {
        1 => imgproc::COLOR_GRAY2RGB,
        3 => imgproc::COLOR_BGR2RGB,
        4 => imgproc::COLOR_BGRA2RGB,
        n => {
            return Err(ci2::Error::SingleFrameError(format!(
                "unsupported number of channels: {n}"
            )));
        }
    };
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, code).map_cv_err()?;
    if rgb.depth() != core::CV_8U {
        return Err(ci2::Error::SingleFrameError(format!(
            "unsupported pixel depth: {}",
            rgb.depth()
        )));
    }
    let width: u32 = rgb.cols().try_into()?;
    let height: u32 = rgb.rows().try_into()?;
    let rgb = if rgb.is_continuous() {
        rgb
    } else {
        rgb.try_clone().map_cv_err()?
    };
    let data = rgb.data_bytes().map_cv_err()?.to_vec();
    image::RgbImage::from_raw(width, height, data)
        .ok_or_else(|| ci2::Error::SingleFrameError("frame buffer too small".into()))
}

impl ci2::Camera for WrappedCamera {
    fn width(&self) -> ci2::Result<u32> {
        let w = self.cap.get(videoio::CAP_PROP_FRAME_WIDTH).map_cv_err()?;
        Ok(w.round() as u32)
    }

    fn height(&self) -> ci2::Result<u32> {
        let h = self.cap.get(videoio::CAP_PROP_FRAME_HEIGHT).map_cv_err()?;
        Ok(h.round() as u32)
    }

    fn set_frame_size(&mut self, width: u32, height: u32) -> ci2::Result<()> {
        let ok_w = self
            .cap
            .set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)
            .map_cv_err()?;
        let ok_h = self
            .cap
            .set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)
            .map_cv_err()?;
        if !(ok_w && ok_h) {
            warn!("device {} did not accept frame size {width}x{height}", self.info.name);
        }
        Ok(())
    }

    fn acquisition_start(&mut self) -> ci2::Result<()> {
        // VideoCapture streams from the moment the device is opened.
        self.acquisition_started = true;
        Ok(())
    }

    fn acquisition_stop(&mut self) -> ci2::Result<()> {
        self.acquisition_started = false;
        Ok(())
    }

    fn next_frame(&mut self) -> ci2::Result<FrameWithInfo> {
        if !self.acquisition_started {
            return Err("acquisition not started".into());
        }
        let grabbed = self.cap.read(&mut self.frame).map_cv_err()?;
        if !grabbed || self.frame.empty() {
            return Err(ci2::Error::SingleFrameError(
                "failed to read frame from video device".into(),
            ));
        }
        let datetime = chrono::Utc::now();
        let image = mat_to_rgb_image(&self.frame)?;
        let fno = self.store_fno;
        self.store_fno += 1;
        Ok(FrameWithInfo {
            image,
            host_timing: HostTimingInfo { fno, datetime },
        })
    }
}

impl Drop for WrappedCamera {
    fn drop(&mut self) {
        if let Err(e) = self.cap.release() {
            warn!("error releasing video device {}: {e}", self.info.name);
        }
    }
}
