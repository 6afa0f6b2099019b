// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SingleFrameError({0})")]
    SingleFrameError(String),
    #[error("Timeout")]
    Timeout,
    #[error("CI2Error({msg})")]
    CI2Error { msg: String },
    #[error("camera \"{0}\" not found")]
    CameraNotFound(String),
    #[error("BackendError({0})")]
    BackendError(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("try from int error: {source}")]
    TryFromIntError {
        #[from]
        source: std::num::TryFromIntError,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CI2Error {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::CI2Error { msg }
    }
}

// ---------------------------
// CameraModule

/// A module for opening cameras (e.g. all video devices known to a backend).
pub trait CameraModule {
    type CameraType: Camera;

    fn name(&self) -> &str;
    fn camera_infos(&self) -> Result<Vec<Box<dyn CameraInfo>>>;
    fn camera(&mut self, name: &str) -> Result<Self::CameraType>;
}

#[derive(Clone)]
pub struct FrameWithInfo {
    /// The image frame acquired from the camera.
    pub image: image::RgbImage,
    /// Frame timing information acquired by the host.
    pub host_timing: HostTimingInfo,
}

impl FrameWithInfo {
    pub fn width(&self) -> u32 {
        self.image.width()
    }
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Timing information acquired on the host computer.
#[derive(Debug, Clone)]
pub struct HostTimingInfo {
    /// The frame number as counted by the host.
    ///
    /// This can deviate from the "real" frame number if the frames were
    /// dropped, as might happen if the computer was busy with a different task.
    pub fno: usize,
    /// The timestamp of the frame when it was acquired by the host.
    pub datetime: chrono::DateTime<chrono::Utc>,
}

// ---------------------------
// CameraInfo

pub trait CameraInfo {
    fn name(&self) -> &str;
    fn serial(&self) -> &str;
    fn model(&self) -> &str;
    fn vendor(&self) -> &str;
}

// ---------------------------
// Camera

pub trait Camera: CameraInfo {
    /// Return the frame width in pixels
    fn width(&self) -> Result<u32>;
    /// Return the frame height in pixels
    fn height(&self) -> Result<u32>;

    /// Request a frame size.
    ///
    /// The camera may pick a different size. Query [Camera::width] and
    /// [Camera::height] afterwards for the size in use.
    fn set_frame_size(&mut self, width: u32, height: u32) -> Result<()>;

    // Acquisition ----------------------------
    fn acquisition_start(&mut self) -> Result<()>;
    fn acquisition_stop(&mut self) -> Result<()>;

    /// synchronous (blocking) frame acquisition
    fn next_frame(&mut self) -> Result<FrameWithInfo>;
}
