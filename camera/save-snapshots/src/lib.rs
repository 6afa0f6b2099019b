use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use eyre::{Context, Result};
use tracing::{error, info, warn};

use ci2::{Camera, CameraModule};

const WINDOW_NAME: &str = "camera";
const KEY_QUIT: u8 = b'q';
const KEY_CAPTURE: u8 = b' ';

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Save snapshots from a camera: press the space bar to save, q to quit"
)]
pub struct Cli {
    /// Folder where the snapshots are saved
    #[arg(long, default_value = "images")]
    pub folder: PathBuf,
    /// Filename prefix of the snapshots
    #[arg(long, default_value = "snapshot")]
    pub name: String,
    /// Requested frame width in pixels (0 keeps the camera default)
    #[arg(long, default_value_t = 0)]
    pub dwidth: u32,
    /// Requested frame height in pixels (0 keeps the camera default)
    #[arg(long, default_value_t = 0)]
    pub dheight: u32,
    /// Load the Raspberry Pi camera V4L2 driver before opening the camera
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub raspi: bool,
    /// Index of the video device
    #[arg(long, default_value_t = 0)]
    pub device: u32,
}

/// Shows live frames and reports key presses.
pub trait SnapshotUi {
    fn show(&mut self, frame: &image::RgbImage) -> Result<()>;
    /// Return the key pressed since the last call, if any.
    fn poll_key(&mut self) -> Result<Option<u8>>;
    fn close(&mut self) -> Result<()>;
}

/// Live view in an OpenCV highgui window.
#[derive(Default)]
pub struct HighGuiUi {}

impl SnapshotUi for HighGuiUi {
    fn show(&mut self, frame: &image::RgbImage) -> Result<()> {
        opencv_calibrate::gui::show_rgb(WINDOW_NAME, frame.as_raw(), frame.width(), frame.height())?;
        Ok(())
    }
    fn poll_key(&mut self) -> Result<Option<u8>> {
        Ok(opencv_calibrate::gui::wait_key(1)?)
    }
    fn close(&mut self) -> Result<()> {
        opencv_calibrate::gui::destroy_all_windows()?;
        Ok(())
    }
}

/// Path of snapshot number `n`: `<folder>/<name>_<width>_<height>_<n>.jpg`.
pub fn snapshot_path(folder: &Path, name: &str, width: u32, height: u32, n: usize) -> PathBuf {
    folder.join(format!("{name}_{width}_{height}_{n}.jpg"))
}

/// Load the V4L2 driver of the Raspberry Pi camera module.
pub fn load_raspi_driver() {
    info!("Loading bcm2835-v4l2 kernel module.");
    match std::process::Command::new("sudo")
        .args(["modprobe", "bcm2835-v4l2"])
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => error!("modprobe bcm2835-v4l2 failed: {status}"),
        Err(e) => error!("could not run modprobe: {e}"),
    }
}

/// Run the capture loop on an opened camera until the quit key is pressed.
///
/// Returns the number of snapshots saved.
pub fn save_snaps<C: Camera, U: SnapshotUi>(cam: &mut C, ui: &mut U, cli: &Cli) -> Result<usize> {
    if cli.dwidth > 0 && cli.dheight > 0 {
        info!("Requesting frame size {}x{}.", cli.dwidth, cli.dheight);
        cam.set_frame_size(cli.dwidth, cli.dheight)?;
    }

    if let Err(e) = std::fs::create_dir_all(&cli.folder) {
        warn!("could not create {}: {e}", cli.folder.display());
    }

    let width = cam.width()?;
    let height = cam.height()?;
    info!("Frame size {width}x{height}.");

    cam.acquisition_start()?;
    let result = capture_loop(cam, ui, cli, width, height);
    // Stop the camera and close the window whatever the outcome.
    let stopped = cam.acquisition_stop();
    let closed = ui.close();
    if result.is_err() {
        if let Err(e) = &stopped {
            warn!("stopping acquisition failed: {e}");
        }
        if let Err(e) = &closed {
            warn!("closing the window failed: {e}");
        }
        return result;
    }
    stopped?;
    closed?;

    result
}

fn capture_loop<C: Camera, U: SnapshotUi>(
    cam: &mut C,
    ui: &mut U,
    cli: &Cli,
    width: u32,
    height: u32,
) -> Result<usize> {
    let mut n_snap = 0;
    loop {
        match cam.next_frame() {
            Ok(frame) => {
                ui.show(&frame.image)?;
                match ui.poll_key()? {
                    Some(KEY_QUIT) => break,
                    Some(KEY_CAPTURE) => {
                        let fname = snapshot_path(&cli.folder, &cli.name, width, height, n_snap);
                        info!("Saving image {n_snap}");
                        frame
                            .image
                            .save(&fname)
                            .with_context(|| format!("Saving {}", fname.display()))?;
                        n_snap += 1;
                    }
                    _ => {}
                }
            }
            Err(ci2::Error::SingleFrameError(s)) => {
                warn!("ignoring SingleFrameError({s})");
                if ui.poll_key()? == Some(KEY_QUIT) {
                    break;
                }
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }
    Ok(n_snap)
}

/// Open the video device named on the command line and save snapshots.
pub fn run(cli: Cli) -> Result<usize> {
    if cli.raspi {
        load_raspi_driver();
    }
    let mut module = ci2_opencv::new_module()?;
    let mut cam = module
        .camera(&cli.device.to_string())
        .with_context(|| format!("Opening video device {}", cli.device))?;
    let mut ui = HighGuiUi::default();
    save_snaps(&mut cam, &mut ui, &cli)
}
