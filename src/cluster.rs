//! Density-based grouping of detections into people.
//!
//! One person can produce two boxes at slightly different offsets even after
//! the detector's own suppression, so raw detections overcount. Detection
//! centers are clustered with DBSCAN semantics:
//!
//! - a point's neighborhood is every point (itself included) within `radius`
//! - a point is a core point when its neighborhood has at least `min_neighbors`
//! - clusters are the connected closure of core points; non-core points within
//!   `radius` of a core point join the cluster of their nearest core point
//! - remaining points are noise, and each one still counts as one person
//!
//! Results do not depend on input order: points are put in a canonical order
//! before clustering and labels are mapped back afterwards.

use std::cmp::Ordering;
use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::Detection;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterParams {
    /// Neighborhood radius in pixels.
    pub radius: f32,
    /// Minimum neighborhood size (the point itself included).
    pub min_neighbors: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            radius: 50.0,
            min_neighbors: 2,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(anyhow!("cluster radius must be a positive number"));
        }
        if self.min_neighbors == 0 {
            return Err(anyhow!("cluster min_neighbors must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterLabel {
    Cluster(usize),
    Noise,
}

/// Per-detection labels, aligned with the input slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAssignment {
    pub labels: Vec<ClusterLabel>,
    pub clusters: usize,
    pub noise: usize,
}

impl ClusterAssignment {
    /// People counted: one per cluster plus one per isolated detection.
    pub fn count(&self) -> usize {
        self.clusters + self.noise
    }

    /// Input indices of each cluster, by cluster id.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.clusters];
        for (index, label) in self.labels.iter().enumerate() {
            if let ClusterLabel::Cluster(id) = label {
                members[*id].push(index);
            }
        }
        members
    }
}

pub fn cluster_detections(detections: &[Detection], params: &ClusterParams) -> ClusterAssignment {
    let points: Vec<(f32, f32)> = detections.iter().map(|d| d.center()).collect();
    let order = canonical_order(detections);
    let sorted: Vec<(f32, f32)> = order.iter().map(|&i| points[i]).collect();

    let sorted_labels = dbscan(&sorted, params);

    let mut labels = vec![ClusterLabel::Noise; detections.len()];
    for (position, &original) in order.iter().enumerate() {
        labels[original] = sorted_labels[position];
    }
    let clusters = labels
        .iter()
        .filter_map(|l| match l {
            ClusterLabel::Cluster(id) => Some(*id + 1),
            ClusterLabel::Noise => None,
        })
        .max()
        .unwrap_or(0);
    let noise = labels.iter().filter(|l| **l == ClusterLabel::Noise).count();
    ClusterAssignment {
        labels,
        clusters,
        noise,
    }
}

/// Count of people for a detection set.
pub fn count_people(detections: &[Detection], params: &ClusterParams) -> usize {
    cluster_detections(detections, params).count()
}

fn canonical_order(detections: &[Detection]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| compare_detections(&detections[a], &detections[b]).then(a.cmp(&b)));
    order
}

fn compare_detections(a: &Detection, b: &Detection) -> Ordering {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ax.total_cmp(&bx)
        .then(ay.total_cmp(&by))
        .then(a.confidence.total_cmp(&b.confidence))
        .then(a.bbox.x0.total_cmp(&b.bbox.x0))
        .then(a.bbox.y0.total_cmp(&b.bbox.y0))
        .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        .then(a.bbox.y1.total_cmp(&b.bbox.y1))
}

fn distance_sq(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}

fn dbscan(points: &[(f32, f32)], params: &ClusterParams) -> Vec<ClusterLabel> {
    let n = points.len();
    let radius_sq = params.radius * params.radius;
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| distance_sq(points[i], points[j]) <= radius_sq)
                .collect()
        })
        .collect();
    let is_core: Vec<bool> = neighbors
        .iter()
        .map(|hood| hood.len() >= params.min_neighbors)
        .collect();

    // Core points first: connected components in canonical order.
    let mut labels = vec![ClusterLabel::Noise; n];
    let mut next_id = 0;
    for start in 0..n {
        if !is_core[start] || labels[start] != ClusterLabel::Noise {
            continue;
        }
        let id = next_id;
        next_id += 1;
        labels[start] = ClusterLabel::Cluster(id);
        let mut queue = VecDeque::from([start]);
        while let Some(point) = queue.pop_front() {
            for &next in &neighbors[point] {
                if is_core[next] && labels[next] == ClusterLabel::Noise {
                    labels[next] = ClusterLabel::Cluster(id);
                    queue.push_back(next);
                }
            }
        }
    }

    // Border points join their nearest core point's cluster.
    for point in 0..n {
        if is_core[point] {
            continue;
        }
        let nearest = neighbors[point]
            .iter()
            .copied()
            .filter(|&other| is_core[other])
            .min_by(|&a, &b| {
                distance_sq(points[point], points[a])
                    .total_cmp(&distance_sq(points[point], points[b]))
                    .then(cluster_id(labels[a]).cmp(&cluster_id(labels[b])))
            });
        if let Some(core) = nearest {
            labels[point] = labels[core];
        }
    }
    labels
}

fn cluster_id(label: ClusterLabel) -> usize {
    match label {
        ClusterLabel::Cluster(id) => id,
        ClusterLabel::Noise => usize::MAX,
    }
}
