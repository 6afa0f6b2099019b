use nalgebra::RealField;
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;
pub mod txt;

type Coords3D = (f64, f64, f64);
type Coords2D = (f64, f64);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("{source}")]
    Calibrate {
        #[from]
        source: opencv_calibrate::Error,
    },
    #[error("cannot parse \"{value}\" on line {line}")]
    ParseFloat { line: usize, value: String },
    #[error("board has {actual} points, expected {n_rows}x{n_cols}")]
    BoardShape {
        n_rows: usize,
        n_cols: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Detected inner corners of one checkerboard view.
///
/// Points are stored in row-major order: `n_cols` corners along each of
/// `n_rows` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerBoardData {
    n_rows: usize,
    n_cols: usize,
    points: Vec<Coords2D>,
}

impl CheckerBoardData {
    pub fn new(n_rows: usize, n_cols: usize, points: &[Coords2D]) -> Self {
        let points = points.to_vec();
        Self {
            n_rows,
            n_cols,
            points,
        }
    }

    /// Build from the `f32` corners returned by the detector.
    pub fn from_corners(n_rows: usize, n_cols: usize, corners: &[(f32, f32)]) -> Self {
        let points: Vec<Coords2D> = corners.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
        Self::new(n_rows, n_cols, &points)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn points(&self) -> &[Coords2D] {
        &self.points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    width: u32,
    height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Write the calibration as a ROS camera info YAML file.
///
/// Two comment lines naming the program, the time and the mean reprojection
/// distance precede the YAML document.
pub fn save_yaml<P: AsRef<std::path::Path>>(
    cam_info_file: P,
    pkg_name: &str,
    local: chrono::DateTime<chrono::Local>,
    raw_opencv_cal: &opencv_calibrate::CalibrationResult,
    raw_cam_name: &str,
) -> Result<()> {
    let intrinsics = convert_to_cam_geom::<f64>(raw_opencv_cal);

    let ci: opencv_ros_camera::RosCameraInfo<_> = opencv_ros_camera::NamedIntrinsicParameters {
        intrinsics,
        width: raw_opencv_cal.image_width as usize,
        height: raw_opencv_cal.image_height as usize,
        name: raw_cam_name.into(),
    }
    .into();

    let mut f = std::fs::File::create(&cam_info_file)?;
    std::io::Write::write_all(
        &mut f,
        format!(
            "# Saved by {} at {}\n\
                        # Mean reprojection distance: {:.2}\n",
            pkg_name, local, raw_opencv_cal.mean_reprojection_distance_pixels
        )
        .as_bytes(),
    )?;
    serde_yaml::to_writer(f, &ci)?;
    Ok(())
}

/// Given some checkerboard corner locations, compute intrinsics using OpenCV.
///
/// `square_size` is the edge length of one board square, in the unit the
/// extrinsics should be reported in.
pub fn compute_intrinsics_with_raw_opencv(
    size: PixelSize,
    data: &[CheckerBoardData],
    square_size: f64,
) -> Result<opencv_calibrate::CalibrationResult> {
    for b in data.iter() {
        if b.points.len() != b.n_rows * b.n_cols {
            return Err(Error::BoardShape {
                n_rows: b.n_rows,
                n_cols: b.n_cols,
                actual: b.points.len(),
            });
        }
    }

    let object_points: Vec<Vec<Coords3D>> = mk_object_points(data, square_size);

    use opencv_calibrate::CorrespondingPoint;
    let pts: Vec<Vec<CorrespondingPoint>> = object_points
        .into_iter()
        .zip(data.iter())
        .map(|(obj_pts, board)| {
            obj_pts
                .into_iter()
                .zip(board.points.iter())
                .map(|(obj_pt, im_pt)| CorrespondingPoint {
                    object_point: obj_pt,
                    image_point: *im_pt,
                })
                .collect()
        })
        .collect();

    Ok(opencv_calibrate::calibrate_camera(
        &pts,
        size.width,
        size.height,
    )?)
}

pub fn convert_to_cam_geom<R: RealField>(
    opencv_results: &opencv_calibrate::CalibrationResult,
) -> opencv_ros_camera::RosOpenCvIntrinsics<R> {
    let fx = nalgebra::convert(opencv_results.camera_matrix[0]);
    let skew = nalgebra::convert(opencv_results.camera_matrix[1]);
    let fy = nalgebra::convert(opencv_results.camera_matrix[4]);
    let cx = nalgebra::convert(opencv_results.camera_matrix[2]);
    let cy = nalgebra::convert(opencv_results.camera_matrix[5]);
    let dist = nalgebra::Vector5::new(
        nalgebra::convert(opencv_results.distortion_coeffs[0]),
        nalgebra::convert(opencv_results.distortion_coeffs[1]),
        nalgebra::convert(opencv_results.distortion_coeffs[2]),
        nalgebra::convert(opencv_results.distortion_coeffs[3]),
        nalgebra::convert(opencv_results.distortion_coeffs[4]),
    );
    let dist = opencv_ros_camera::Distortion::from_opencv_vec(dist);

    opencv_ros_camera::RosOpenCvIntrinsics::from_params_with_distortion(fx, skew, fy, cx, cy, dist)
}

/// Given some checkerboard corner locations, compute intrinsics
pub fn compute_intrinsics<R: RealField>(
    size: PixelSize,
    data: &[CheckerBoardData],
    square_size: f64,
) -> Result<opencv_ros_camera::RosOpenCvIntrinsics<R>> {
    let opencv_results = compute_intrinsics_with_raw_opencv(size, data, square_size)?;
    Ok(convert_to_cam_geom(&opencv_results))
}

/// Board coordinates of the inner corners, in detector order.
///
/// Corner `j` lies at column `j % n_cols` and row `j / n_cols`, so x runs
/// along a row of the board.
pub fn mk_object_points(data: &[CheckerBoardData], square_size: f64) -> Vec<Vec<Coords3D>> {
    let mut result = Vec::with_capacity(data.len());
    for b in data.iter() {
        let num_pts = b.n_cols * b.n_rows;
        let mut opts_loc: Vec<Coords3D> = Vec::with_capacity(num_pts);
        for j in 0..num_pts {
            let x = (j % b.n_cols) as f64 * square_size;
            let y = (j / b.n_cols) as f64 * square_size;
            opts_loc.push((x, y, 0.0));
        }
        result.push(opts_loc);
    }
    result
}

/// Undistort an image with a calibration and crop it to the valid region.
///
/// `alpha` is passed to the new camera matrix computation (1 keeps every
/// source pixel). If the valid region is empty the full undistorted image is
/// returned.
pub fn undistort_and_crop(
    image: &image::RgbImage,
    cal: &opencv_calibrate::CalibrationResult,
    alpha: f64,
) -> Result<image::RgbImage> {
    let (width, height) = image.dimensions();
    if (width, height) != (cal.image_width, cal.image_height) {
        tracing::warn!(
            "undistorting {width}x{height} image with a calibration for {}x{}",
            cal.image_width,
            cal.image_height
        );
    }
    let (new_camera_matrix, roi) = opencv_calibrate::optimal_new_camera_matrix(
        &cal.camera_matrix,
        &cal.distortion_coeffs,
        width,
        height,
        alpha,
    )?;
    let undistorted = opencv_calibrate::undistort_rgb(
        image.as_raw(),
        width,
        height,
        &cal.camera_matrix,
        &cal.distortion_coeffs,
        &new_camera_matrix,
    )?;
    let undistorted = image::RgbImage::from_raw(width, height, undistorted).ok_or(
        opencv_calibrate::Error::BadImageBuffer {
            expected: width as usize * height as usize * 3,
            actual: 0,
        },
    )?;

    let x = roi.x.min(width);
    let y = roi.y.min(height);
    let roi_w = roi.width.min(width - x);
    let roi_h = roi.height.min(height - y);
    if roi_w == 0 || roi_h == 0 {
        tracing::warn!("valid region of undistorted image is empty, not cropping");
        return Ok(undistorted);
    }
    tracing::debug!("cropping undistorted image to {roi_w}x{roi_h}+{x}+{y}");
    Ok(image::imageops::crop_imm(&undistorted, x, y, roi_w, roi_h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn object_points_run_along_columns() {
        let board = CheckerBoardData::new(2, 3, &[(0.0, 0.0); 6]);
        let pts = mk_object_points(&[board], 25.0);
        assert_eq!(pts.len(), 1);
        assert_eq!(
            pts[0],
            vec![
                (0.0, 0.0, 0.0),
                (25.0, 0.0, 0.0),
                (50.0, 0.0, 0.0),
                (0.0, 25.0, 0.0),
                (25.0, 25.0, 0.0),
                (50.0, 25.0, 0.0),
            ]
        );
    }

    #[test]
    fn wrong_point_count_is_rejected() {
        let board = CheckerBoardData::new(2, 3, &[(0.0, 0.0); 5]);
        let err = compute_intrinsics_with_raw_opencv(
            PixelSize::new(640, 480),
            &[board.clone(), board],
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BoardShape { actual: 5, .. }));
    }

    #[test]
    fn intrinsics_from_synthetic_corners() {
        let camera = synthetic::SyntheticCamera::default();
        let board = synthetic::BoardSpec::default();
        let data: Vec<CheckerBoardData> = synthetic::standard_poses()
            .iter()
            .map(|pose| {
                let pts = camera.project_corners(&board, pose);
                CheckerBoardData::new(board.n_rows, board.n_cols, &pts)
            })
            .collect();
        let size = PixelSize::new(camera.width, camera.height);
        let intrinsics: opencv_ros_camera::RosOpenCvIntrinsics<f64> =
            compute_intrinsics(size, &data, board.square_size).unwrap();
        assert_relative_eq!(intrinsics.p[(0, 0)], camera.fx, max_relative = 0.01);
        assert_relative_eq!(intrinsics.p[(1, 1)], camera.fy, max_relative = 0.01);
        assert_relative_eq!(intrinsics.p[(0, 2)], camera.cx, epsilon = 2.0);
        assert_relative_eq!(intrinsics.p[(1, 2)], camera.cy, epsilon = 2.0);
    }

    #[test]
    fn yaml_has_header_and_intrinsics() {
        let camera = synthetic::SyntheticCamera::default();
        let board = synthetic::BoardSpec::default();
        let data: Vec<CheckerBoardData> = synthetic::standard_poses()
            .iter()
            .map(|pose| {
                let pts = camera.project_corners(&board, pose);
                CheckerBoardData::new(board.n_rows, board.n_cols, &pts)
            })
            .collect();
        let cal = compute_intrinsics_with_raw_opencv(
            PixelSize::new(camera.width, camera.height),
            &data,
            board.square_size,
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera_info.yaml");
        save_yaml(&path, "camcal-test", chrono::Local::now(), &cal, "cam1").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("# Saved by camcal-test at "));
        assert!(
            lines
                .next()
                .unwrap()
                .starts_with("# Mean reprojection distance: ")
        );
        assert!(contents.contains("camera_name: cam1"));
        assert!(contents.contains("image_width: 640"));
    }

    #[test]
    fn undistort_without_distortion_crops_nothing() {
        let camera = synthetic::SyntheticCamera::default();
        let cal = opencv_calibrate::CalibrationResult {
            mean_reprojection_error: 0.0,
            mean_reprojection_distance_pixels: 0.0,
            camera_matrix: camera.camera_matrix(),
            distortion_coeffs: [0.0; 5],
            rotation_vectors: vec![],
            translation_vectors: vec![],
            image_width: camera.width,
            image_height: camera.height,
        };
        let view = camera.render(
            &synthetic::BoardSpec::default(),
            &synthetic::standard_poses()[0],
        );
        let out = undistort_and_crop(&view, &cal, 1.0).unwrap();
        assert!(out.width() >= camera.width - 2);
        assert!(out.height() >= camera.height - 2);
    }

    #[test]
    fn undistort_with_barrel_distortion_crops() {
        let mut camera = synthetic::SyntheticCamera::default();
        camera.k1 = -0.3;
        let mut dist = [0.0; 5];
        dist[0] = camera.k1;
        let cal = opencv_calibrate::CalibrationResult {
            mean_reprojection_error: 0.0,
            mean_reprojection_distance_pixels: 0.0,
            camera_matrix: camera.camera_matrix(),
            distortion_coeffs: dist,
            rotation_vectors: vec![],
            translation_vectors: vec![],
            image_width: camera.width,
            image_height: camera.height,
        };
        let view = camera.render(
            &synthetic::BoardSpec::default(),
            &synthetic::standard_poses()[0],
        );
        let out = undistort_and_crop(&view, &cal, 1.0).unwrap();
        assert!(out.width() < camera.width || out.height() < camera.height);
    }
}
