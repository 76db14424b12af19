//! Observation-to-track association.
//!
//! Every in-frame track is either paired with one observation or declared
//! undetected, and every observation left over is treated as a new face. The
//! arrangement with the highest joint probability wins. For the handful of faces
//! a camera sees at once this is found by exhaustive search with pruning; past
//! [`AssociationConfig::exhaustive_limit`] tracks the same objective is handed to
//! a linear assignment solver.

use log::{debug, warn};
use nalgebra::Point2;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::tracker::camera::FrameGeometry;
use crate::tracker::face_track::FaceTrack;
use crate::tracker::observation::Observation;

/// Cost of a forbidden pairing in the linear assignment fallback.
const FORBIDDEN: f64 = 1e6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Pairs further apart than this (meters) never match.
    pub gating_distance: f64,
    /// Width of the proximity score, in meters.
    pub proximity_sigma: f64,
    /// Pairs with a lower joint probability are not considered.
    pub min_joint_probability: f64,
    /// Factor for each observation that no track claims.
    pub new_track_probability: f64,
    /// Multiplier applied to the detection probability of an occluded track.
    pub occlusion_factor: f64,
    /// Distance from the image border (pixels) below which detection probability tapers.
    pub edge_margin: f64,
    /// Fraction of the detection probability left at the very edge.
    pub edge_floor: f64,
    /// Upper bound on any track's detection probability.
    pub max_visibility: f64,
    /// Largest in-frame track count solved by exhaustive search.
    pub exhaustive_limit: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            gating_distance: 0.4,
            proximity_sigma: 0.15,
            min_joint_probability: 0.01,
            new_track_probability: 0.05,
            occlusion_factor: 0.1,
            edge_margin: 40.0,
            edge_floor: 0.2,
            max_visibility: 0.9,
            exhaustive_limit: 8,
        }
    }
}

/// How likely a track is to be detected this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Visibility {
    Visible { probability: f64 },
    /// Behind a nearer face.
    Occluded { probability: f64 },
    /// Outside the image or behind the camera; excluded from assignment.
    OutOfFrame,
}

impl Visibility {
    #[inline]
    pub fn probability(&self) -> f64 {
        match *self {
            Visibility::Visible { probability } | Visibility::Occluded { probability } => probability,
            Visibility::OutOfFrame => 0.0,
        }
    }

    #[inline]
    pub fn is_in_frame(&self) -> bool {
        !matches!(self, Visibility::OutOfFrame)
    }
}

/// Outcome of associating one frame's observations with the live tracks.
///
/// Indices refer to the slices passed to [`Associator::associate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// One entry per in-frame track: the observation it explains, if any.
    pub assignments: Vec<(usize, Option<usize>)>,
    pub out_of_frame: Vec<usize>,
    /// Observations no track claimed.
    pub unclaimed: Vec<usize>,
    /// Per track, in input order.
    pub visibility: Vec<Visibility>,
    /// Joint probability of the chosen arrangement.
    pub score: f64,
}

/// Detection probability of every track, accounting for occlusion and the image border.
pub fn face_observed_probability(
    tracks: &[FaceTrack],
    frame: &FrameGeometry<'_>,
    config: &AssociationConfig,
    face_radius: f64,
) -> Vec<Visibility> {
    let camera = frame.camera;
    let origin = frame.camera_origin();

    let projected: Vec<Option<(Point2<f64>, f64)>> = tracks
        .iter()
        .map(|t| {
            let pos = t.position();
            let pixel = frame.project(&pos)?;
            let distance = (pos - origin.unwrap_or_else(|| t.camera_origin())).norm();
            Some((pixel, distance))
        })
        .collect();

    let mut order: Vec<usize> = (0..tracks.len()).collect();
    order.sort_by(|&a, &b| {
        let da = projected[a].map_or(f64::INFINITY, |p| p.1);
        let db = projected[b].map_or(f64::INFINITY, |p| p.1);
        da.total_cmp(&db)
    });

    let mut visibility = vec![Visibility::OutOfFrame; tracks.len()];
    let mut nearer: Vec<(Point2<f64>, f64)> = Vec::new();

    for idx in order {
        let Some((pixel, distance)) = projected[idx] else {
            continue;
        };
        let edge = camera.edge_distance(&pixel);
        if edge < 0.0 {
            continue;
        }

        let base = tracks[idx].confidence();
        let occluded = nearer.iter().any(|(p, d)| {
            let radius = face_radius * camera.fx / d.max(f64::EPSILON);
            (pixel - p).norm() < radius
        });

        visibility[idx] = if occluded {
            Visibility::Occluded {
                probability: (base * config.occlusion_factor).clamp(0.0, config.max_visibility),
            }
        } else {
            let taper = if edge >= config.edge_margin {
                1.0
            } else {
                config.edge_floor + (1.0 - config.edge_floor) * edge / config.edge_margin
            };
            Visibility::Visible {
                probability: (base * taper).clamp(0.0, config.max_visibility),
            }
        };
        nearer.push((pixel, distance));
    }

    visibility
}

/// Gaussian-shaped closeness score, zero beyond the gating distance.
#[inline]
pub fn proximity_likelihood(distance: f64, config: &AssociationConfig) -> f64 {
    if distance > config.gating_distance {
        return 0.0;
    }
    let sigma = config.proximity_sigma;
    (-(distance * distance) / (2.0 * sigma * sigma)).exp()
}

/// Probability that each track (row) and observation (column) are the same face.
/// Pairs under the configured floor are zero.
pub fn joint_probabilities(
    tracks: &[FaceTrack],
    observations: &[Observation],
    config: &AssociationConfig,
) -> Array2<f64> {
    let mut joint = Array2::zeros((tracks.len(), observations.len()));
    for (i, track) in tracks.iter().enumerate() {
        let pos = track.position();
        let confidence = track.confidence();
        for (j, obs) in observations.iter().enumerate() {
            let p = proximity_likelihood((obs.head - pos).norm(), config) * confidence;
            if p >= config.min_joint_probability {
                joint[[i, j]] = p;
            }
        }
    }
    joint
}

/// Exhaustive search for the most probable arrangement.
///
/// `rows` selects the tracks taking part and `miss[k]` is the probability that
/// `rows[k]` goes undetected. Returns the chosen observation per row and the
/// arrangement's probability.
pub fn best_assignment(
    joint: &Array2<f64>,
    rows: &[usize],
    miss: &[f64],
    new_track_probability: f64,
) -> (Vec<Option<usize>>, f64) {
    let cols = joint.ncols();
    let candidates = rows
        .iter()
        .map(|&row| {
            let mut cands: Vec<usize> = (0..cols).filter(|&j| joint[[row, j]] > 0.0).collect();
            cands.sort_by(|&a, &b| joint[[row, b]].total_cmp(&joint[[row, a]]));
            cands
        })
        .collect();

    let mut search = Search {
        joint,
        rows,
        miss,
        new_track_probability,
        candidates,
        claimed: vec![false; cols],
        current: vec![None; rows.len()],
        best: vec![None; rows.len()],
        best_score: 0.0,
    };
    search.descend(0, 1.0);
    (search.best, search.best_score)
}

struct Search<'a> {
    joint: &'a Array2<f64>,
    rows: &'a [usize],
    miss: &'a [f64],
    new_track_probability: f64,
    candidates: Vec<Vec<usize>>,
    claimed: Vec<bool>,
    current: Vec<Option<usize>>,
    best: Vec<Option<usize>>,
    best_score: f64,
}

impl Search<'_> {
    fn descend(&mut self, depth: usize, score: f64) {
        // Every factor is at most one, so a partial score bounds its completions.
        if score <= self.best_score {
            return;
        }

        if depth == self.rows.len() {
            let unclaimed = self.claimed.iter().filter(|c| !**c).count();
            let total = score * self.new_track_probability.powi(unclaimed as i32);
            if total > self.best_score {
                self.best_score = total;
                self.best.clone_from(&self.current);
            }
            return;
        }

        let row = self.rows[depth];
        for k in 0..self.candidates[depth].len() {
            let col = self.candidates[depth][k];
            if self.claimed[col] {
                continue;
            }
            self.claimed[col] = true;
            self.current[depth] = Some(col);
            self.descend(depth + 1, score * self.joint[[row, col]]);
            self.claimed[col] = false;
        }

        self.current[depth] = None;
        self.descend(depth + 1, score * self.miss[depth]);
    }
}

/// Same objective as [`best_assignment`], solved as a linear assignment over
/// negative log probabilities.
///
/// The matrix is square with `rows + cols` entries per side: each track gets a
/// private "undetected" column and each observation a private "new face" row.
pub fn linear_assignment(
    joint: &Array2<f64>,
    rows: &[usize],
    miss: &[f64],
    new_track_probability: f64,
) -> (Vec<Option<usize>>, f64) {
    let n = rows.len();
    let m = joint.ncols();
    let size = n + m;
    if size == 0 {
        return (vec![], 1.0);
    }

    let cost = |p: f64| if p > 0.0 { -p.ln() } else { FORBIDDEN };
    let mut padded = Array2::<f64>::from_elem((size, size), FORBIDDEN);

    for (k, &row) in rows.iter().enumerate() {
        for j in 0..m {
            padded[[k, j]] = cost(joint[[row, j]]);
        }
        padded[[k, m + k]] = cost(miss[k]);
    }
    for j in 0..m {
        padded[[n + j, j]] = cost(new_track_probability);
        for k in 0..n {
            padded[[n + j, m + k]] = 0.0;
        }
    }

    let mut choice = vec![None; n];
    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (k, slot) in choice.iter_mut().enumerate() {
                let col = row_to_col[k];
                if col < m && joint[[rows[k], col]] > 0.0 {
                    *slot = Some(col);
                }
            }
        }
        Err(err) => {
            warn!("linear assignment failed ({err:?}); treating all tracks as undetected");
        }
    }

    let score = arrangement_score(joint, rows, miss, new_track_probability, &choice);
    (choice, score)
}

fn arrangement_score(
    joint: &Array2<f64>,
    rows: &[usize],
    miss: &[f64],
    new_track_probability: f64,
    choice: &[Option<usize>],
) -> f64 {
    let mut claimed = vec![false; joint.ncols()];
    let mut score = 1.0;
    for (k, c) in choice.iter().enumerate() {
        match c {
            Some(col) => {
                claimed[*col] = true;
                score *= joint[[rows[k], *col]];
            }
            None => score *= miss[k],
        }
    }
    let unclaimed = claimed.iter().filter(|c| !**c).count();
    score * new_track_probability.powi(unclaimed as i32)
}

/// Runs the per-frame association over a read-only view of the tracks.
#[derive(Debug, Clone)]
pub struct Associator<'a> {
    config: &'a AssociationConfig,
    face_radius: f64,
}

impl<'a> Associator<'a> {
    pub fn new(config: &'a AssociationConfig, face_radius: f64) -> Self {
        Self { config, face_radius }
    }

    pub fn associate(
        &self,
        tracks: &[FaceTrack],
        observations: &[Observation],
        frame: &FrameGeometry<'_>,
    ) -> Association {
        let visibility = face_observed_probability(tracks, frame, self.config, self.face_radius);

        let (rows, out_of_frame): (Vec<usize>, Vec<usize>) =
            (0..tracks.len()).partition(|&i| visibility[i].is_in_frame());
        let miss: Vec<f64> = rows.iter().map(|&i| 1.0 - visibility[i].probability()).collect();

        let joint = joint_probabilities(tracks, observations, self.config);

        let (choice, score) = if rows.len() <= self.config.exhaustive_limit {
            best_assignment(&joint, &rows, &miss, self.config.new_track_probability)
        } else {
            debug!("{} tracks in frame, using linear assignment", rows.len());
            linear_assignment(&joint, &rows, &miss, self.config.new_track_probability)
        };

        let mut claimed = vec![false; observations.len()];
        for c in choice.iter().flatten() {
            claimed[*c] = true;
        }
        let unclaimed = (0..observations.len()).filter(|&j| !claimed[j]).collect();

        Association {
            assignments: rows.into_iter().zip(choice).collect(),
            out_of_frame,
            unclaimed,
            visibility,
            score,
        }
    }
}
