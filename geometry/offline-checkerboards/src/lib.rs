use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgAction, Parser};
use eyre::{self as anyhow, Context, Result};
use tracing::{error, info, warn};

/// Minimum number of image files required before any detection is attempted.
pub const MIN_IMAGES: usize = 9;

/// Files with this in their name are earlier outputs, not calibration images.
const RESULT_MARKER: &str = "calibresult";

const REVIEW_WINDOW: &str = "checkerboard";

pub const CALIBRESULT_FNAME: &str = "calibresult.png";
pub const CAMERA_MATRIX_FNAME: &str = "cameraMatrix.txt";
pub const CAMERA_DISTORTION_FNAME: &str = "cameraDistortion.txt";
pub const CAMERA_INFO_FNAME: &str = "camera_info.yaml";

/// Image in the input folder undistorted when `--reference` is not given.
pub const DEFAULT_REFERENCE_FNAME: &str = "curvada.jpg";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    disable_help_flag = true,
    after_help = "Writes calibresult.png (the undistorted reference image), \
        cameraMatrix.txt, cameraDistortion.txt and camera_info.yaml into the \
        output directory (by default the image folder)."
)]
pub struct Cli {
    /// Folder with the checkerboard images
    #[arg(default_value = "images")]
    pub folder: Utf8PathBuf,
    /// Extension of the image files (e.g. jpg, png)
    #[arg(default_value = "jpg")]
    pub image_type: String,
    /// Number of inner corner rows of the checkerboard
    #[arg(default_value_t = 7)]
    pub rows: usize,
    /// Number of inner corner columns of the checkerboard
    #[arg(default_value_t = 10)]
    pub cols: usize,
    /// Edge length of one checkerboard square (e.g. in mm)
    #[arg(default_value_t = 25.0)]
    pub cell_dimension: f64,
    /// Image to undistort into calibresult.png. Defaults to curvada.jpg in
    /// the image folder, or, if that does not exist, the last image that was
    /// rejected or had no checkerboard.
    #[arg(long)]
    pub reference: Option<Utf8PathBuf>,
    /// Accept every detection without showing it
    #[arg(long)]
    pub no_review: bool,
    /// Directory for the output files (default: the image folder)
    #[arg(long)]
    pub output_dir: Option<Utf8PathBuf>,
    /// Print help
    #[arg(short = 'h', long = "help", alias = "h", action = ArgAction::Help)]
    help: Option<bool>,
}

#[derive(thiserror::Error, Debug)]
pub enum CalError {
    #[error("found {found} images, at least {required} are needed")]
    NotEnoughImages { found: usize, required: usize },
    #[error(
        "only {accepted} checkerboard views were accepted, at least 2 are needed \
        (take at least {MIN_IMAGES} good pictures and try again)"
    )]
    NotEnoughDetections { accepted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Decides whether a detected checkerboard is used for calibration.
pub trait Reviewer {
    /// `annotated` is the image with the detected corners drawn on it.
    fn review(&mut self, fname: &Utf8Path, annotated: &image::RgbImage) -> Result<Verdict>;
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accepts every detection.
pub struct AcceptAll;

impl Reviewer for AcceptAll {
    fn review(&mut self, _fname: &Utf8Path, _annotated: &image::RgbImage) -> Result<Verdict> {
        Ok(Verdict::Accept)
    }
}

/// ESC rejects a detection, any other key (or none) accepts it.
pub fn verdict_for_key(key: Option<u8>) -> Verdict {
    if key == Some(opencv_calibrate::gui::KEY_ESC) {
        Verdict::Reject
    } else {
        Verdict::Accept
    }
}

/// Shows each detection in a window. ESC rejects it, any other key accepts.
#[derive(Default)]
pub struct HighGuiReviewer {
    shown: bool,
}

impl Reviewer for HighGuiReviewer {
    fn review(&mut self, fname: &Utf8Path, annotated: &image::RgbImage) -> Result<Verdict> {
        opencv_calibrate::gui::show_rgb(
            REVIEW_WINDOW,
            annotated.as_raw(),
            annotated.width(),
            annotated.height(),
        )
        .with_context(|| format!("Showing {fname}"))?;
        self.shown = true;
        let verdict = verdict_for_key(opencv_calibrate::gui::wait_key(0)?);
        if verdict == Verdict::Reject {
            info!("    rejected {fname}");
        }
        Ok(verdict)
    }

    fn finish(&mut self) -> Result<()> {
        if self.shown {
            opencv_calibrate::gui::destroy_all_windows()?;
            self.shown = false;
        }
        Ok(())
    }
}

/// What a successful calibration run produced.
#[derive(Debug)]
pub struct CalOutput {
    pub calibration: opencv_calibrate::CalibrationResult,
    pub n_accepted: usize,
    pub reference: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
}

/// List `<dirname>/*.<image_type>`, case-insensitively and sorted.
pub fn get_image_files(dirname: &Utf8Path, image_type: &str) -> Result<Vec<Utf8PathBuf>> {
    if !std::fs::metadata(dirname)
        .with_context(|| format!("Opening \"{dirname}\""))?
        .is_dir()
    {
        anyhow::bail!("Attempting to open \"{dirname}\" because it is not a directory.");
    }
    let image_type = image_type.trim_start_matches('.');
    let pattern = dirname.join(format!("*.{image_type}")).to_string();

    let mut paths = vec![];
    for path in glob::glob_with(
        &pattern,
        glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        },
    )? {
        let path = Utf8PathBuf::from_path_buf(path?)
            .map_err(|p| anyhow::eyre!("non UTF-8 path {}", p.display()))?;
        paths.push(path);
    }

    paths.sort();
    Ok(paths)
}

fn is_result_file(fname: &Utf8Path) -> bool {
    fname
        .file_name()
        .is_some_and(|n| n.contains(RESULT_MARKER))
}

/// Pick the image to undistort: `--reference`, else the default reference
/// image in the input folder, else `not_good`.
fn choose_reference(cli: &Cli, not_good: Utf8PathBuf) -> Utf8PathBuf {
    if let Some(reference) = &cli.reference {
        info!("Using reference image {reference} given on the command line.");
        return reference.clone();
    }
    let default_reference = cli.folder.join(DEFAULT_REFERENCE_FNAME);
    if default_reference.is_file() {
        info!("Using reference image {default_reference}.");
        default_reference
    } else {
        info!("No {DEFAULT_REFERENCE_FNAME} in {}, using {not_good}.", cli.folder);
        not_good
    }
}

/// Calibrate from the images named on the command line, reviewing
/// detections in a window unless `--no-review` was given.
pub fn run_cal(cli: Cli) -> Result<CalOutput> {
    if cli.no_review {
        run_cal_with_reviewer(cli, &mut AcceptAll)
    } else {
        let mut reviewer = HighGuiReviewer::default();
        let result = run_cal_with_reviewer(cli, &mut reviewer);
        // Close the windows also when the run failed during review.
        reviewer.finish()?;
        result
    }
}

/// Calibrate, asking `reviewer` about every detection.
///
/// [Reviewer::finish] is called once all images have been reviewed, before
/// the solver runs.
pub fn run_cal_with_reviewer<R: Reviewer>(cli: Cli, reviewer: &mut R) -> Result<CalOutput> {
    let fnames = get_image_files(&cli.folder, &cli.image_type)?;
    if fnames.len() < MIN_IMAGES {
        error!(
            "Found {} images in \"{}\", at least {MIN_IMAGES} are needed.",
            fnames.len(),
            cli.folder
        );
        return Err(CalError::NotEnoughImages {
            found: fnames.len(),
            required: MIN_IMAGES,
        }
        .into());
    }

    let (n_rows, n_cols) = (cli.rows, cli.cols);
    info!("Attempting to find {n_cols}x{n_rows} chessboard.");

    let mut not_good = fnames[1].clone();
    let mut image_width = 0;
    let mut image_height = 0;

    let mut goodcorners = Vec::with_capacity(fnames.len());
    for fname in fnames.iter() {
        if is_result_file(fname) {
            continue;
        }
        info!("{fname}");
        let img = image::open(fname)
            .with_context(|| format!("Opening {fname}"))?
            .to_rgb8();
        let (w, h) = img.dimensions();
        image_width = w;
        image_height = h;

        let corners = opencv_calibrate::find_chessboard_corners(img.as_raw(), w, h, n_cols, n_rows)
            .with_context(|| format!("Finding checkerboard in {fname}"))?;
        let Some(corners) = corners else {
            info!("    no checkerboard found");
            not_good = fname.clone();
            continue;
        };
        info!("    {} corners.", corners.len());

        let annotated = opencv_calibrate::draw_chessboard_corners(
            img.as_raw(),
            w,
            h,
            n_cols,
            n_rows,
            &corners,
        )?;
        let annotated = image::RgbImage::from_raw(w, h, annotated)
            .ok_or_else(|| anyhow::eyre!("annotated image has wrong size"))?;

        match reviewer.review(fname, &annotated)? {
            Verdict::Accept => {
                goodcorners.push(camcal::CheckerBoardData::from_corners(
                    n_rows, n_cols, &corners,
                ));
            }
            Verdict::Reject => {
                not_good = fname.clone();
            }
        }
    }

    reviewer.finish()?;

    info!("{} of {} images accepted.", goodcorners.len(), fnames.len());
    if goodcorners.len() <= 1 {
        error!("In order to calibrate you need at least {MIN_IMAGES} good pictures... try again");
        return Err(CalError::NotEnoughDetections {
            accepted: goodcorners.len(),
        }
        .into());
    }

    let size = camcal::PixelSize::new(image_width, image_height);
    let raw_opencv_cal =
        camcal::compute_intrinsics_with_raw_opencv(size, &goodcorners, cli.cell_dimension)
            .context("Calibrating camera")?;
    let intrinsics = camcal::convert_to_cam_geom::<f64>(&raw_opencv_cal);
    info!("got calibrated intrinsics: {:?}", intrinsics);
    info!("Camera matrix: {:?}", raw_opencv_cal.camera_matrix);
    info!("Distortion coefficients: {:?}", raw_opencv_cal.distortion_coeffs);

    let reference = choose_reference(&cli, not_good);
    let reference_img = image::open(&reference)
        .with_context(|| format!("Opening {reference}"))?
        .to_rgb8();
    let undistorted = camcal::undistort_and_crop(&reference_img, &raw_opencv_cal, 1.0)
        .with_context(|| format!("Undistorting {reference}"))?;

    let out_dir = cli.output_dir.as_ref().unwrap_or(&cli.folder);
    std::fs::create_dir_all(out_dir).with_context(|| format!("Creating {out_dir}"))?;
    let mut files = Vec::new();

    let calibresult = out_dir.join(CALIBRESULT_FNAME);
    undistorted
        .save(&calibresult)
        .with_context(|| format!("Saving {calibresult}"))?;
    files.push(calibresult);

    let matrix_fname = out_dir.join(CAMERA_MATRIX_FNAME);
    camcal::txt::save_camera_matrix_txt(&matrix_fname, &raw_opencv_cal.camera_matrix)
        .with_context(|| format!("Saving {matrix_fname}"))?;
    files.push(matrix_fname);

    let distortion_fname = out_dir.join(CAMERA_DISTORTION_FNAME);
    camcal::txt::save_distortion_txt(&distortion_fname, &raw_opencv_cal.distortion_coeffs)
        .with_context(|| format!("Saving {distortion_fname}"))?;
    files.push(distortion_fname);

    files.push(save_camera_info(out_dir, &cli.folder, &raw_opencv_cal)?);

    info!(
        "Mean reprojection error: {}",
        raw_opencv_cal.mean_reprojection_distance_pixels
    );
    if raw_opencv_cal.mean_reprojection_distance_pixels > 1.0 {
        warn!("Large reprojection error, consider removing blurry images.");
    }

    Ok(CalOutput {
        calibration: raw_opencv_cal,
        n_accepted: goodcorners.len(),
        reference,
        files,
    })
}

fn save_camera_info(
    out_dir: &Utf8Path,
    folder: &Utf8Path,
    raw_opencv_cal: &opencv_calibrate::CalibrationResult,
) -> Result<Utf8PathBuf> {
    let cam_name = folder
        .file_name()
        .unwrap_or(folder.as_str())
        .to_string();

    let local = chrono::Local::now();
    let cam_info_file_stamped = out_dir.join(
        local
            .format("camera_info.%Y%m%d_%H%M%S.yaml")
            .to_string(),
    );
    let cam_info_file = out_dir.join(CAMERA_INFO_FNAME);

    // Save timestamped version first for backup purposes (since below
    // we overwrite the non-timestamped file).
    camcal::save_yaml(
        &cam_info_file_stamped,
        env!["CARGO_PKG_NAME"],
        local,
        raw_opencv_cal,
        &cam_name,
    )
    .with_context(|| format!("Saving {cam_info_file_stamped}"))?;

    // Now copy the successfully saved file into the non-timestamped
    // name. This will overwrite an existing file.
    std::fs::copy(&cam_info_file_stamped, &cam_info_file)
        .with_context(|| format!("Copying to file {cam_info_file}"))?;

    info!("Saved camera calibration to file: {cam_info_file}");
    Ok(cam_info_file)
}
