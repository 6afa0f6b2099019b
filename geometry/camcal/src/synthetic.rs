//! Rendered checkerboard views from a known camera.
//!
//! These stand in for photographs of a printed board when testing detection
//! and calibration. Board coordinates follow [crate::mk_object_points]: inner
//! corner `(col, row)` sits at `(col * square_size, row * square_size, 0)`.

use nalgebra::{Point3, Rotation3, Vector3};

/// Pinhole camera with radial distortion.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
            k1: 0.0,
            k2: 0.0,
        }
    }
}

/// Inner corner counts and square size of a printed board.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSpec {
    pub n_rows: usize,
    pub n_cols: usize,
    pub square_size: f64,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            n_rows: 7,
            n_cols: 10,
            square_size: 25.0,
        }
    }
}

/// Transformation from board coordinates to camera coordinates.
#[derive(Debug, Clone)]
pub struct BoardPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardPose {
    /// Place the board center at `(dx, dy, distance)` in camera coordinates
    /// after rotating it by `roll` (about x) and `pitch` (about y), in
    /// degrees.
    pub fn centered(
        board: &BoardSpec,
        roll_deg: f64,
        pitch_deg: f64,
        distance: f64,
        dx: f64,
        dy: f64,
    ) -> Self {
        let rotation =
            Rotation3::from_euler_angles(roll_deg.to_radians(), pitch_deg.to_radians(), 0.0);
        let center = Vector3::new(
            (board.n_cols - 1) as f64 * board.square_size / 2.0,
            (board.n_rows - 1) as f64 * board.square_size / 2.0,
            0.0,
        );
        let translation = Vector3::new(dx, dy, distance) - rotation * center;
        Self {
            rotation,
            translation,
        }
    }

    fn to_camera(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation * p + self.translation
    }
}

/// Ten poses tilted up to 20 degrees, all fully inside the default camera's
/// field of view for the default board.
pub fn standard_poses() -> Vec<BoardPose> {
    let board = BoardSpec::default();
    [
        (0.0, 0.0, 600.0, 0.0, 0.0),
        (20.0, 0.0, 650.0, 0.0, 10.0),
        (-20.0, 0.0, 650.0, 10.0, -10.0),
        (0.0, 20.0, 650.0, -10.0, 0.0),
        (0.0, -20.0, 650.0, 10.0, 5.0),
        (15.0, 15.0, 650.0, 0.0, 0.0),
        (-15.0, 15.0, 680.0, -15.0, 5.0),
        (15.0, -15.0, 680.0, 15.0, -5.0),
        (-15.0, -15.0, 650.0, 0.0, 0.0),
        (10.0, -5.0, 620.0, -20.0, 10.0),
    ]
    .iter()
    .map(|&(roll, pitch, distance, dx, dy)| {
        BoardPose::centered(&board, roll, pitch, distance, dx, dy)
    })
    .collect()
}

impl SyntheticCamera {
    /// Camera matrix in row major order.
    pub fn camera_matrix(&self) -> [f64; 9] {
        [
            self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0,
        ]
    }

    fn radial_factor(&self, x: f64, y: f64) -> f64 {
        let r2 = x * x + y * y;
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    /// Project a point in camera coordinates to pixel coordinates.
    pub fn project(&self, p: &Point3<f64>) -> (f64, f64) {
        let x = p.x / p.z;
        let y = p.y / p.z;
        let f = self.radial_factor(x, y);
        (self.fx * x * f + self.cx, self.fy * y * f + self.cy)
    }

    /// Viewing ray (z = 1) through a pixel.
    fn unproject(&self, u: f64, v: f64) -> Vector3<f64> {
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..10 {
            let f = self.radial_factor(x, y);
            x = xd / f;
            y = yd / f;
        }
        Vector3::new(x, y, 1.0)
    }

    /// Pixel locations of the inner corners in row-major order.
    pub fn project_corners(&self, board: &BoardSpec, pose: &BoardPose) -> Vec<(f64, f64)> {
        let mut result = Vec::with_capacity(board.n_rows * board.n_cols);
        for row in 0..board.n_rows {
            for col in 0..board.n_cols {
                let p = Point3::new(
                    col as f64 * board.square_size,
                    row as f64 * board.square_size,
                    0.0,
                );
                result.push(self.project(&pose.to_camera(&p)));
            }
        }
        result
    }

    /// Render the board seen from `pose`, with a one square white margin
    /// around it and a gray background.
    pub fn render(&self, board: &BoardSpec, pose: &BoardPose) -> image::RgbImage {
        const SUBSAMPLES: [f64; 2] = [-0.25, 0.25];
        let r_inv = pose.rotation.inverse();
        let origin = r_inv * (-pose.translation);

        image::RgbImage::from_fn(self.width, self.height, |px, py| {
            let mut sum = 0.0;
            for sy in SUBSAMPLES {
                for sx in SUBSAMPLES {
                    let ray = r_inv * self.unproject(px as f64 + sx, py as f64 + sy);
                    sum += if ray.z.abs() < 1e-12 {
                        BACKGROUND
                    } else {
                        let s = -origin.z / ray.z;
                        if s <= 0.0 {
                            BACKGROUND
                        } else {
                            let hit = origin + ray * s;
                            board_intensity(board, hit.x, hit.y)
                        }
                    };
                }
            }
            let v = (sum / 4.0).round().clamp(0.0, 255.0) as u8;
            image::Rgb([v, v, v])
        })
    }
}

const BACKGROUND: f64 = 110.0;

fn board_intensity(board: &BoardSpec, x: f64, y: f64) -> f64 {
    let sq = board.square_size;
    // Square `i` spans [(i - 1) * sq, i * sq], so inner corner `c` sits
    // between squares `c` and `c + 1`.
    let i = ((x + sq) / sq).floor();
    let j = ((y + sq) / sq).floor();
    let cols = (board.n_cols + 1) as f64;
    let rows = (board.n_rows + 1) as f64;
    if i >= 0.0 && i < cols && j >= 0.0 && j < rows {
        if (i as i64 + j as i64) % 2 == 0 {
            0.0
        } else {
            255.0
        }
    } else if i >= -1.0 && i < cols + 1.0 && j >= -1.0 && j < rows + 1.0 {
        255.0
    } else {
        BACKGROUND
    }
}
