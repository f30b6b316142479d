use lapjv::{Matrix, lapjv};

use crate::settings::MatchType;

/// Column-major cost matrix between N tracks and M regions.
///
/// The cost of assigning track `i` to region `j` lives at `i + j * N`.
#[derive(Clone, Debug)]
pub struct CostMatrix {
    data: Vec<f32>,
    tracks: usize,
    regions: usize,
    max_cost: f32,
}

impl CostMatrix {
    pub fn new(tracks: usize, regions: usize) -> Self {
        Self {
            data: vec![0.0; tracks * regions],
            tracks,
            regions,
            max_cost: 0.0,
        }
    }

    #[inline]
    pub fn get(&self, track: usize, region: usize) -> f32 {
        self.data[track + region * self.tracks]
    }

    #[inline]
    pub fn set(&mut self, track: usize, region: usize, cost: f32) {
        self.data[track + region * self.tracks] = cost;
        self.max_cost = self.max_cost.max(cost);
    }

    #[inline]
    pub fn tracks(&self) -> usize {
        self.tracks
    }

    #[inline]
    pub fn regions(&self) -> usize {
        self.regions
    }

    /// Largest cost stored so far.
    #[inline]
    pub fn max_cost(&self) -> f32 {
        self.max_cost
    }
}

/// Solves the assignment between tracks and regions.
///
/// Returns one slot per track; `None` marks an unmatched track and every
/// `Some(region)` is unique. Neither strategy applies the gating threshold to
/// solved costs; the caller filters afterwards. [`MatchType::Bipart`] does use
/// `dist_threshold` to decide which edges exist at all.
pub(crate) fn solve(
    match_type: MatchType,
    cost: &CostMatrix,
    dist_threshold: f32,
) -> Vec<Option<usize>> {
    match match_type {
        MatchType::Hungarian => solve_hungarian(cost),
        MatchType::Bipart => solve_bipartite(cost, dist_threshold),
    }
}

/// Exact minimum-cost assignment, padded square so the LAP solver accepts a
/// rectangular problem. Pad entries cost more than any real entry, so they are
/// only chosen for rows or columns that cannot be matched.
fn solve_hungarian(cost: &CostMatrix) -> Vec<Option<usize>> {
    let n = cost.tracks();
    let m = cost.regions();
    if n == 0 || m == 0 {
        return vec![None; n];
    }

    let k = n.max(m);
    let pad = cost.max_cost() + 1.0;
    let mut data = vec![pad; k * k];
    for i in 0..n {
        for j in 0..m {
            data[i * k + j] = cost.get(i, j);
        }
    }

    let mat = Matrix::from_shape_vec((k, k), data).expect("square cost matrix");
    let (rows, _) = lapjv(&mat).expect("lapjv solves finite matrices");
    (0..n)
        .map(|i| {
            let j = rows[i];
            (j < m).then_some(j)
        })
        .collect()
}

/// Maximum matching over the edges that survive the gate, preferring cheap
/// edges. Ties break by lowest cost, then by region index.
fn solve_bipartite(cost: &CostMatrix, gate: f32) -> Vec<Option<usize>> {
    let n = cost.tracks();
    let m = cost.regions();
    let adjacency: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            let mut edges: Vec<usize> = (0..m).filter(|&j| cost.get(i, j) <= gate).collect();
            edges.sort_by(|&a, &b| cost.get(i, a).total_cmp(&cost.get(i, b)).then(a.cmp(&b)));
            edges
        })
        .collect();

    fn try_assign(
        track: usize,
        adjacency: &[Vec<usize>],
        visited: &mut [bool],
        region_owner: &mut [Option<usize>],
    ) -> bool {
        for &region in &adjacency[track] {
            if visited[region] {
                continue;
            }
            visited[region] = true;
            let free = match region_owner[region] {
                None => true,
                Some(owner) => try_assign(owner, adjacency, visited, region_owner),
            };
            if free {
                region_owner[region] = Some(track);
                return true;
            }
        }
        false
    }

    let mut region_owner: Vec<Option<usize>> = vec![None; m];
    for track in 0..n {
        let mut visited = vec![false; m];
        try_assign(track, &adjacency, &mut visited, &mut region_owner);
    }

    let mut assignment = vec![None; n];
    for (region, owner) in region_owner.iter().enumerate() {
        if let Some(track) = owner {
            assignment[*track] = Some(region);
        }
    }
    assignment
}
