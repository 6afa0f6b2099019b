//! Minimal access to OpenCV's highgui windows.

use opencv::{core::Mat, highgui, imgproc};

use crate::{Result, rgb_to_mat};

/// Key code of the escape key as returned by [wait_key].
pub const KEY_ESC: u8 = 27;

/// Show an RGB8 image in the named window, creating it if needed.
pub fn show_rgb(window: &str, rgb_data: &[u8], width: u32, height: u32) -> Result<()> {
    let rgb = rgb_to_mat(rgb_data, width, height)?;
    let mut bgr = Mat::default();
    imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)?;
    highgui::imshow(window, &bgr)?;
    Ok(())
}

/// Wait for a key press. A delay of 0 waits forever.
///
/// Returns `None` if no key was pressed before the delay elapsed.
pub fn wait_key(delay_msec: i32) -> Result<Option<u8>> {
    let key = highgui::wait_key(delay_msec)?;
    if key < 0 {
        Ok(None)
    } else {
        Ok(Some((key & 0xFF) as u8))
    }
}

pub fn destroy_all_windows() -> Result<()> {
    highgui::destroy_all_windows()?;
    Ok(())
}
