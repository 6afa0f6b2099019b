use std::collections::VecDeque;

use clap::Parser;
use eyre::Result;

use ci2::{FrameWithInfo, HostTimingInfo};
use save_snapshots::{Cli, SnapshotUi, save_snaps, snapshot_path};

/// Camera producing uniform frames. Frame numbers listed in `fail` return a
/// `SingleFrameError` instead.
struct FakeCamera {
    width: u32,
    height: u32,
    max_width: u32,
    fno: usize,
    fail: Vec<usize>,
    started: bool,
}

impl FakeCamera {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_width: 64,
            fno: 0,
            fail: vec![],
            started: false,
        }
    }
}

impl ci2::CameraInfo for FakeCamera {
    fn name(&self) -> &str {
        "fake"
    }
    fn serial(&self) -> &str {
        "0"
    }
    fn model(&self) -> &str {
        "fake"
    }
    fn vendor(&self) -> &str {
        "test"
    }
}

impl ci2::Camera for FakeCamera {
    fn width(&self) -> ci2::Result<u32> {
        Ok(self.width)
    }
    fn height(&self) -> ci2::Result<u32> {
        Ok(self.height)
    }
    fn set_frame_size(&mut self, width: u32, height: u32) -> ci2::Result<()> {
        // Like real devices, pick the closest supported size.
        self.width = width.min(self.max_width);
        self.height = height;
        Ok(())
    }
    fn acquisition_start(&mut self) -> ci2::Result<()> {
        self.started = true;
        Ok(())
    }
    fn acquisition_stop(&mut self) -> ci2::Result<()> {
        self.started = false;
        Ok(())
    }
    fn next_frame(&mut self) -> ci2::Result<FrameWithInfo> {
        assert!(self.started);
        let fno = self.fno;
        self.fno += 1;
        if self.fail.contains(&fno) {
            return Err(ci2::Error::SingleFrameError("dropped".into()));
        }
        let v = (fno % 256) as u8;
        Ok(FrameWithInfo {
            image: image::RgbImage::from_pixel(self.width, self.height, image::Rgb([v, v, v])),
            host_timing: HostTimingInfo {
                fno,
                datetime: chrono::Utc::now(),
            },
        })
    }
}

/// Replays key presses, then quits.
struct ScriptedUi {
    keys: VecDeque<Option<u8>>,
    shown: usize,
    closed: bool,
}

impl ScriptedUi {
    fn new(keys: &[Option<u8>]) -> Self {
        Self {
            keys: keys.iter().copied().collect(),
            shown: 0,
            closed: false,
        }
    }
}

impl SnapshotUi for ScriptedUi {
    fn show(&mut self, _frame: &image::RgbImage) -> Result<()> {
        self.shown += 1;
        Ok(())
    }
    fn poll_key(&mut self) -> Result<Option<u8>> {
        Ok(self.keys.pop_front().unwrap_or(Some(b'q')))
    }
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn cli_for(folder: &std::path::Path, extra: &[&str]) -> Cli {
    let mut args = vec![
        "save-snapshots".to_string(),
        "--folder".to_string(),
        folder.display().to_string(),
        "--name".to_string(),
        "cal".to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    Cli::try_parse_from(args).unwrap()
}

#[test]
fn numbers_increase_per_capture() -> Result<()> {
    let root = tempfile::tempdir()?;
    let folder = root.path().join("snaps");
    let cli = cli_for(&folder, &[]);

    let mut cam = FakeCamera::new(32, 24);
    let mut ui = ScriptedUi::new(&[
        None,
        Some(b' '),
        Some(b'x'),
        None,
        Some(b' '),
        Some(b' '),
        Some(b'q'),
        Some(b' '),
    ]);
    let n = save_snaps(&mut cam, &mut ui, &cli)?;

    assert_eq!(n, 3);
    assert!(ui.closed);
    assert!(!cam.started);
    assert_eq!(ui.shown, 7);
    for i in 0..3 {
        let fname = snapshot_path(&folder, "cal", 32, 24, i);
        assert!(fname.exists(), "{}", fname.display());
        let img = image::open(&fname)?;
        assert_eq!((img.width(), img.height()), (32, 24));
    }
    // The key after 'q' is never read.
    assert!(!snapshot_path(&folder, "cal", 32, 24, 3).exists());
    let n_files = std::fs::read_dir(&folder)?.count();
    assert_eq!(n_files, 3);
    Ok(())
}

#[test]
fn dropped_frames_are_skipped() -> Result<()> {
    let root = tempfile::tempdir()?;
    let cli = cli_for(root.path(), &[]);

    let mut cam = FakeCamera::new(16, 16);
    cam.fail = vec![0, 2];
    let mut ui = ScriptedUi::new(&[
        None,
        Some(b' '),
        None,
        Some(b' '),
        Some(b'q'),
    ]);
    let n = save_snaps(&mut cam, &mut ui, &cli)?;
    assert_eq!(n, 2);
    assert_eq!(ui.shown, 3);
    assert!(snapshot_path(root.path(), "cal", 16, 16, 1).exists());
    Ok(())
}

#[test]
fn requested_size_uses_actual_camera_size() -> Result<()> {
    let root = tempfile::tempdir()?;
    let cli = cli_for(root.path(), &["--dwidth", "100", "--dheight", "40"]);

    let mut cam = FakeCamera::new(16, 16);
    let mut ui = ScriptedUi::new(&[Some(b' '), Some(b'q')]);
    let n = save_snaps(&mut cam, &mut ui, &cli)?;
    assert_eq!(n, 1);
    assert!(snapshot_path(root.path(), "cal", 64, 40, 0).exists());
    Ok(())
}

#[test]
fn window_is_closed_when_saving_fails() -> Result<()> {
    let root = tempfile::tempdir()?;
    // A regular file where the snapshot folder should be.
    let blocker = root.path().join("not_a_dir");
    std::fs::write(&blocker, b"")?;
    let cli = cli_for(&blocker.join("snaps"), &[]);

    let mut cam = FakeCamera::new(16, 16);
    let mut ui = ScriptedUi::new(&[None, Some(b' '), Some(b' ')]);
    let err = save_snaps(&mut cam, &mut ui, &cli).unwrap_err();
    assert!(err.to_string().starts_with("Saving "), "{err}");
    assert_eq!(ui.shown, 2);
    assert!(ui.closed);
    assert!(!cam.started);
    Ok(())
}

#[test]
fn size_needs_both_dimensions() -> Result<()> {
    let root = tempfile::tempdir()?;
    let cli = cli_for(root.path(), &["--dwidth", "48"]);

    let mut cam = FakeCamera::new(16, 12);
    let mut ui = ScriptedUi::new(&[Some(b' '), Some(b'q')]);
    save_snaps(&mut cam, &mut ui, &cli)?;
    assert!(snapshot_path(root.path(), "cal", 16, 12, 0).exists());
    Ok(())
}
