//! Camera calibration routines from OpenCV behind a plain-data API.
//!
//! Images cross this API as packed RGB8 buffers and calibration parameters as
//! fixed-size arrays, so callers never handle OpenCV types directly.

use opencv::{
    calib3d,
    core::{self, Mat, Point2f, Point3d, Point3f, Rect, Scalar, Size, TermCriteria, Vector},
    imgproc,
    prelude::*,
};

pub mod gui;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("OpenCV error: {source}")]
    Cv {
        #[from]
        source: opencv::Error,
    },
    #[error("image buffer has {actual} bytes, expected {expected}")]
    BadImageBuffer { expected: usize, actual: usize },
    #[error("view {view} has {object} object points but {image} image points")]
    PointCountMismatch {
        view: usize,
        object: usize,
        image: usize,
    },
    #[error("at least two views are needed for calibration, got {0}")]
    NotEnoughViews(usize),
    #[error("{what} has {len} elements")]
    UnexpectedShape { what: &'static str, len: usize },
    #[error("try from int error: {source}")]
    TryFromIntError {
        #[from]
        source: std::num::TryFromIntError,
    },
}

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// RMS reprojection error reported by the solver
    pub mean_reprojection_error: f64,
    /// per-view L2 residual norm divided by the number of points, averaged
    /// over views
    pub mean_reprojection_distance_pixels: f64,
    /// camera calibration matrix, row major order
    pub camera_matrix: [f64; 9],
    /// non-linear distortion coefficients (k1, k2, p1, p2, k3)
    pub distortion_coeffs: [f64; 5],
    /// rotation vectors (Rodrigues), one per view
    pub rotation_vectors: Vec<[f64; 3]>,
    /// translation vectors, one per view
    pub translation_vectors: Vec<[f64; 3]>,
    pub image_width: u32,
    pub image_height: u32,
}

/// A point with a view in image (2D) and world (3D)
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondingPoint {
    pub object_point: (f64, f64, f64),
    pub image_point: (f64, f64),
}

/// Region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<Rect> for Roi {
    fn from(r: Rect) -> Self {
        // OpenCV never reports negative extents for a valid ROI.
        let clamp = |v: i32| u32::try_from(v).unwrap_or(0);
        Self {
            x: clamp(r.x),
            y: clamp(r.y),
            width: clamp(r.width),
            height: clamp(r.height),
        }
    }
}

fn subpix_criteria() -> Result<TermCriteria> {
    Ok(TermCriteria::new(
        core::TermCriteria_EPS + core::TermCriteria_MAX_ITER,
        30,
        0.001,
    )?)
}

fn calibration_criteria() -> Result<TermCriteria> {
    Ok(TermCriteria::new(
        core::TermCriteria_COUNT + core::TermCriteria_EPS,
        30,
        f64::EPSILON,
    )?)
}

fn image_size(width: u32, height: u32) -> Result<Size> {
    Ok(Size::new(width.try_into()?, height.try_into()?))
}

/// Copy a packed RGB8 buffer into a new 3-channel `Mat`.
pub(crate) fn rgb_to_mat(rgb_data: &[u8], width: u32, height: u32) -> Result<Mat> {
    let expected = width as usize * height as usize * 3;
    if rgb_data.len() != expected {
        return Err(Error::BadImageBuffer {
            expected,
            actual: rgb_data.len(),
        });
    }
    let size = image_size(width, height)?;
    let mut mat =
        Mat::new_rows_cols_with_default(size.height, size.width, core::CV_8UC3, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(rgb_data);
    Ok(mat)
}

pub(crate) fn mat_to_bytes(mat: &Mat) -> Result<Vec<u8>> {
    if mat.is_continuous() {
        Ok(mat.data_bytes()?.to_vec())
    } else {
        let owned = mat.try_clone()?;
        Ok(owned.data_bytes()?.to_vec())
    }
}

fn mat_to_f64s(mat: &Mat) -> Result<Vec<f64>> {
    let rows: Vec<Vec<f64>> = mat.to_vec_2d()?;
    Ok(rows.into_iter().flatten().collect())
}

fn to_array<const N: usize>(what: &'static str, values: &[f64]) -> Result<[f64; N]> {
    values.try_into().map_err(|_| Error::UnexpectedShape {
        what,
        len: values.len(),
    })
}

fn camera_matrix_mat(camera_matrix: &[f64; 9]) -> Result<Mat> {
    let rows = [
        [camera_matrix[0], camera_matrix[1], camera_matrix[2]],
        [camera_matrix[3], camera_matrix[4], camera_matrix[5]],
        [camera_matrix[6], camera_matrix[7], camera_matrix[8]],
    ];
    Ok(Mat::from_slice_2d(&rows)?)
}

/// Find the inner corners of a chessboard and refine them to sub-pixel
/// accuracy.
///
/// `pattern_width` and `pattern_height` count inner corners (a board of 8x8
/// squares has 7x7 corners). Returns `Ok(None)` if the pattern is not found.
/// Corners are returned in row-major order.
pub fn find_chessboard_corners(
    rgb_data: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
) -> Result<Option<Vec<(f32, f32)>>> {
    let rgb = rgb_to_mat(rgb_data, im_width, im_height)?;
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&rgb, &mut gray, imgproc::COLOR_RGB2GRAY)?;

    let pattern = Size::new(pattern_width.try_into()?, pattern_height.try_into()?);
    let mut corners = Vector::<Point2f>::new();
    let found = calib3d::find_chessboard_corners(
        &gray,
        pattern,
        &mut corners,
        calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
    )?;
    if !found {
        return Ok(None);
    }

    // Harris corners can be off by a pixel or so on poor images.
    imgproc::corner_sub_pix(
        &gray,
        &mut corners,
        Size::new(11, 11),
        Size::new(-1, -1),
        subpix_criteria()?,
    )?;
    Ok(Some(corners.iter().map(|p| (p.x, p.y)).collect()))
}

/// Draw detected chessboard corners onto a copy of an RGB8 image.
pub fn draw_chessboard_corners(
    rgb_data: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
    corners: &[(f32, f32)],
) -> Result<Vec<u8>> {
    let rgb = rgb_to_mat(rgb_data, im_width, im_height)?;
    let mut bgr = Mat::default();
    imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)?;

    let pattern = Size::new(pattern_width.try_into()?, pattern_height.try_into()?);
    let corners: Vector<Point2f> = corners.iter().map(|&(x, y)| Point2f::new(x, y)).collect();
    let pattern_was_found = corners.len() == pattern_width * pattern_height;
    calib3d::draw_chessboard_corners(&mut bgr, pattern, &corners, pattern_was_found)?;

    let mut out = Mat::default();
    imgproc::cvt_color_def(&bgr, &mut out, imgproc::COLOR_BGR2RGB)?;
    mat_to_bytes(&out)
}

/// Calibrate a camera from point correspondences in several views.
pub fn calibrate_camera(
    all_pts: &[Vec<CorrespondingPoint>],
    width: u32,
    height: u32,
) -> Result<CalibrationResult> {
    if all_pts.len() < 2 {
        return Err(Error::NotEnoughViews(all_pts.len()));
    }

    let mut object_points = Vector::<Vector<Point3f>>::new();
    let mut image_points = Vector::<Vector<Point2f>>::new();
    for view in all_pts.iter() {
        object_points.push(
            view.iter()
                .map(|pt| {
                    let (x, y, z) = pt.object_point;
                    Point3f::new(x as f32, y as f32, z as f32)
                })
                .collect(),
        );
        image_points.push(
            view.iter()
                .map(|pt| Point2f::new(pt.image_point.0 as f32, pt.image_point.1 as f32))
                .collect(),
        );
    }

    let mut camera_matrix = Mat::default();
    let mut distortion_coeffs = Mat::default();
    let mut rvecs = Vector::<Mat>::new();
    let mut tvecs = Vector::<Mat>::new();
    let mean_reprojection_error = calib3d::calibrate_camera(
        &object_points,
        &image_points,
        image_size(width, height)?,
        &mut camera_matrix,
        &mut distortion_coeffs,
        &mut rvecs,
        &mut tvecs,
        0,
        calibration_criteria()?,
    )?;

    let camera_matrix: [f64; 9] = to_array("camera matrix", &mat_to_f64s(&camera_matrix)?)?;
    let distortion_coeffs: [f64; 5] =
        to_array("distortion coefficients", &mat_to_f64s(&distortion_coeffs)?)?;
    let rotation_vectors = rvecs
        .iter()
        .map(|m| to_array("rotation vector", &mat_to_f64s(&m)?))
        .collect::<Result<Vec<[f64; 3]>>>()?;
    let translation_vectors = tvecs
        .iter()
        .map(|m| to_array("translation vector", &mat_to_f64s(&m)?))
        .collect::<Result<Vec<[f64; 3]>>>()?;

    debug_assert!(rotation_vectors.len() == all_pts.len());
    debug_assert!(translation_vectors.len() == all_pts.len());

    let mut total_distance = 0.0;
    for (view_idx, view) in all_pts.iter().enumerate() {
        let object: Vec<_> = view.iter().map(|pt| pt.object_point).collect();
        let projected = project_points(
            &object,
            &rotation_vectors[view_idx],
            &translation_vectors[view_idx],
            &camera_matrix,
            &distortion_coeffs,
        )?;
        let observed: Vec<_> = view.iter().map(|pt| pt.image_point).collect();
        total_distance += view_reprojection_distance(view_idx, &observed, &projected)?;
    }
    let mean_reprojection_distance_pixels = total_distance / all_pts.len() as f64;
    tracing::debug!(
        "calibrated from {} views: rms {:.4}, mean distance {:.4} px",
        all_pts.len(),
        mean_reprojection_error,
        mean_reprojection_distance_pixels
    );

    Ok(CalibrationResult {
        mean_reprojection_error,
        mean_reprojection_distance_pixels,
        camera_matrix,
        distortion_coeffs,
        rotation_vectors,
        translation_vectors,
        image_width: width,
        image_height: height,
    })
}

/// L2 norm of the stacked residuals of one view, divided by its point count.
pub fn view_reprojection_distance(
    view: usize,
    observed: &[(f64, f64)],
    projected: &[(f64, f64)],
) -> Result<f64> {
    if observed.len() != projected.len() {
        return Err(Error::PointCountMismatch {
            view,
            object: projected.len(),
            image: observed.len(),
        });
    }
    if observed.is_empty() {
        return Ok(0.0);
    }
    let sum_sq: f64 = observed
        .iter()
        .zip(projected.iter())
        .map(|(o, p)| (o.0 - p.0).powi(2) + (o.1 - p.1).powi(2))
        .sum();
    Ok(sum_sq.sqrt() / observed.len() as f64)
}

/// Project 3D points into the image of a calibrated camera.
pub fn project_points(
    object_points: &[(f64, f64, f64)],
    rvec: &[f64; 3],
    tvec: &[f64; 3],
    camera_matrix: &[f64; 9],
    distortion_coeffs: &[f64; 5],
) -> Result<Vec<(f64, f64)>> {
    let object: Vector<Point3d> = object_points
        .iter()
        .map(|&(x, y, z)| Point3d::new(x, y, z))
        .collect();
    let mut image = Vector::<core::Point2d>::new();
    calib3d::project_points(
        &object,
        &Vector::<f64>::from_slice(rvec),
        &Vector::<f64>::from_slice(tvec),
        &camera_matrix_mat(camera_matrix)?,
        &Vector::<f64>::from_slice(distortion_coeffs),
        &mut image,
        &mut core::no_array(),
        0.0,
    )?;
    Ok(image.iter().map(|p| (p.x, p.y)).collect())
}

/// Compute the new camera matrix for undistortion and the region of the
/// undistorted image that contains only valid pixels.
///
/// `alpha` of 0 keeps only valid pixels, 1 keeps all source pixels.
pub fn optimal_new_camera_matrix(
    camera_matrix: &[f64; 9],
    distortion_coeffs: &[f64; 5],
    width: u32,
    height: u32,
    alpha: f64,
) -> Result<([f64; 9], Roi)> {
    let size = image_size(width, height)?;
    let mut roi = Rect::default();
    let new_camera_matrix = calib3d::get_optimal_new_camera_matrix(
        &camera_matrix_mat(camera_matrix)?,
        &Vector::<f64>::from_slice(distortion_coeffs),
        size,
        alpha,
        size,
        Some(&mut roi),
        false,
    )?;
    let new_camera_matrix = to_array("new camera matrix", &mat_to_f64s(&new_camera_matrix)?)?;
    Ok((new_camera_matrix, roi.into()))
}

/// Remove lens distortion from an RGB8 image.
///
/// The output has the same size as the input and is sampled bilinearly.
pub fn undistort_rgb(
    rgb_data: &[u8],
    width: u32,
    height: u32,
    camera_matrix: &[f64; 9],
    distortion_coeffs: &[f64; 5],
    new_camera_matrix: &[f64; 9],
) -> Result<Vec<u8>> {
    let src = rgb_to_mat(rgb_data, width, height)?;
    let size = image_size(width, height)?;

    let mut map_x = Mat::default();
    let mut map_y = Mat::default();
    calib3d::init_undistort_rectify_map(
        &camera_matrix_mat(camera_matrix)?,
        &Vector::<f64>::from_slice(distortion_coeffs),
        &core::no_array(),
        &camera_matrix_mat(new_camera_matrix)?,
        size,
        core::CV_32FC1,
        &mut map_x,
        &mut map_y,
    )?;

    let mut dst = Mat::default();
    imgproc::remap(
        &src,
        &mut dst,
        &map_x,
        &map_y,
        imgproc::INTER_LINEAR,
        core::BORDER_CONSTANT,
        Scalar::default(),
    )?;
    mat_to_bytes(&dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const K: [f64; 9] = [800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0];

    /// Project with an ideal pinhole: rotation about y by `yaw` radians.
    fn pinhole(pt: (f64, f64, f64), yaw: f64, t: (f64, f64, f64)) -> (f64, f64) {
        let (s, c) = yaw.sin_cos();
        let x = c * pt.0 + s * pt.2 + t.0;
        let y = pt.1 + t.1;
        let z = -s * pt.0 + c * pt.2 + t.2;
        (K[0] * x / z + K[2], K[4] * y / z + K[5])
    }

    fn synthetic_views() -> Vec<Vec<CorrespondingPoint>> {
        let poses = [
            (0.0, (-100.0, -80.0, 600.0)),
            (0.3, (-120.0, -60.0, 650.0)),
            (-0.3, (-60.0, -90.0, 620.0)),
            (0.15, (-140.0, -40.0, 700.0)),
            (-0.2, (-90.0, -100.0, 560.0)),
        ];
        poses
            .iter()
            .map(|&(yaw, t)| {
                let mut view = Vec::new();
                for row in 0..6 {
                    for col in 0..9 {
                        // tilt the board about x a little so views are not
                        // all related by a pure yaw.
                        let object_point = (col as f64 * 25.0, row as f64 * 25.0, 0.0);
                        let tilted = (
                            object_point.0,
                            object_point.1 * 0.95,
                            object_point.1 * 0.3 * yaw.signum(),
                        );
                        let image_point = pinhole(tilted, yaw, t);
                        view.push(CorrespondingPoint {
                            object_point,
                            image_point,
                        });
                    }
                }
                view
            })
            .collect()
    }

    #[test]
    fn rejects_single_view() {
        let views = synthetic_views();
        let err = calibrate_camera(&views[..1], 640, 480).unwrap_err();
        assert!(matches!(err, Error::NotEnoughViews(1)));
    }

    #[test]
    fn rejects_bad_buffer() {
        let err = find_chessboard_corners(&[0u8; 10], 4, 5, 3, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::BadImageBuffer {
                expected: 60,
                actual: 10
            }
        ));
    }

    #[test]
    fn recovers_focal_length() {
        let views = synthetic_views();
        let result = calibrate_camera(&views, 640, 480).unwrap();
        assert_relative_eq!(result.camera_matrix[0], K[0], max_relative = 0.05);
        assert_relative_eq!(result.camera_matrix[4], K[4], max_relative = 0.05);
        assert_eq!(result.rotation_vectors.len(), views.len());
        assert!(result.mean_reprojection_error < 0.1);
        assert!(result.mean_reprojection_distance_pixels < 0.1);
        assert_eq!((result.image_width, result.image_height), (640, 480));
    }

    #[test]
    fn reprojection_distance_of_known_residuals() {
        let observed = [(0.0, 0.0), (1.0, 1.0)];
        let projected = [(3.0, 4.0), (1.0, 1.0)];
        let d = view_reprojection_distance(0, &observed, &projected).unwrap();
        assert_relative_eq!(d, 2.5);
        assert!(view_reprojection_distance(0, &observed, &projected[..1]).is_err());
    }

    #[test]
    fn no_distortion_keeps_full_roi() {
        let (new_k, roi) = optimal_new_camera_matrix(&K, &[0.0; 5], 640, 480, 1.0).unwrap();
        assert_relative_eq!(new_k[0], K[0], max_relative = 0.01);
        assert_relative_eq!(new_k[2], K[2], epsilon = 1.0);
        assert!(roi.width >= 638 && roi.height >= 478, "{roi:?}");
    }

    #[test]
    fn undistort_without_distortion_is_identity() {
        let (w, h) = (64u32, 48u32);
        let k = [50.0, 0.0, 32.0, 0.0, 50.0, 24.0, 0.0, 0.0, 1.0];
        let rgb: Vec<u8> = (0..w * h)
            .flat_map(|i| {
                let v = ((i % w) * 4) as u8;
                [v, v / 2, 255 - v]
            })
            .collect();
        let out = undistort_rgb(&rgb, w, h, &k, &[0.0; 5], &k).unwrap();
        assert_eq!(out.len(), rgb.len());
        let max_diff = out
            .iter()
            .zip(rgb.iter())
            .map(|(a, b)| (*a as i32 - *b as i32).abs())
            .max()
            .unwrap();
        assert!(max_diff <= 1, "max diff {max_diff}");
    }

    #[test]
    fn finds_frontal_chessboard() {
        // 8x6 squares of 40 px with a 40 px white margin -> 7x5 inner corners.
        let square = 40u32;
        let (cols, rows) = (8u32, 6u32);
        let (w, h) = ((cols + 2) * square, (rows + 2) * square);
        let mut rgb = vec![255u8; (w * h * 3) as usize];
        for y in 0..h {
            for x in 0..w {
                let (bx, by) = (x / square, y / square);
                let inside = (1..=cols).contains(&bx) && (1..=rows).contains(&by);
                if inside && (bx + by) % 2 == 0 {
                    let i = ((y * w + x) * 3) as usize;
                    rgb[i..i + 3].copy_from_slice(&[0, 0, 0]);
                }
            }
        }
        let corners = find_chessboard_corners(&rgb, w, h, 7, 5).unwrap().unwrap();
        assert_eq!(corners.len(), 35);
        for (x, y) in corners {
            // every inner corner lies on the square lattice
            let fx = x / square as f32;
            let fy = y / square as f32;
            assert!((fx - fx.round()).abs() < 0.05, "x={x}");
            assert!((fy - fy.round()).abs() < 0.05, "y={y}");
        }

        let blank = vec![255u8; (w * h * 3) as usize];
        assert!(find_chessboard_corners(&blank, w, h, 7, 5).unwrap().is_none());
    }
}
