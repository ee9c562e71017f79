//! Optimal bipartite assignment via the Jonker-Volgenant shortest-augmenting
//! path variant of the Hungarian algorithm (spec §4.5).
//!
//! Rows are tracks, columns are detections. The cost matrix is padded to
//! square with `f64::MAX / 2.0` sentinels so an assignment that would only
//! be possible by using a forbidden (gated-out) pairing is never chosen
//! over leaving a row or column unmatched.

const SENTINEL: f64 = f64::MAX / 4.0;

/// Solves the assignment problem for a `rows x cols` cost matrix (rows
/// outer, cols inner). Returns, for each row, the assigned column index or
/// `None` if the row is left unmatched because every feasible pairing was
/// a sentinel.
///
/// `cost` must be rectangular (every row the same length); behaviour is
/// unspecified otherwise, same as the teacher's `solve_assignment`.
pub fn solve(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    if rows == 0 {
        return Vec::new();
    }
    let cols = cost[0].len();
    if cols == 0 {
        return vec![None; rows];
    }

    let n = rows.max(cols);
    let mut a = vec![vec![SENTINEL; n]; n];
    for (r, row) in cost.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            a[r][c] = v;
        }
    }

    // 1-indexed Jonker-Volgenant formulation: u/v are row/column
    // potentials, p[j] is the row currently matched to column j (0 = none),
    // way[j] records the predecessor column on the augmenting path.
    let inf = f64::MAX / 2.0;
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![inf; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0usize;

            for j in 1..=n {
                if !used[j] {
                    let cur = a[i0 - 1][j - 1] - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; rows];
    for j in 1..=n {
        let row = p[j];
        if row >= 1 && row <= rows && j - 1 < cols {
            let r = row - 1;
            let c = j - 1;
            if cost[r][c] < SENTINEL {
                assignment[r] = Some(c);
            }
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matrix() {
        let assignment = solve(&[]);
        assert!(assignment.is_empty());
    }

    #[test]
    fn test_trivial_single_pair() {
        let cost = vec![vec![1.0]];
        assert_eq!(solve(&cost), vec![Some(0)]);
    }

    #[test]
    fn test_scenario_s4_optimal_not_greedy() {
        // A greedy nearest-neighbour assignment would pick (0,0)=1 and then
        // be forced into (1,1)=10, total 11. The optimal assignment is
        // (0,1)=2 and (1,0)=3, total 5.
        let cost = vec![vec![1.0, 2.0], vec![3.0, 10.0]];
        let assignment = solve(&cost);
        assert_eq!(assignment, vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_rectangular_more_rows_than_cols() {
        let cost = vec![vec![4.0], vec![1.0], vec![3.0]];
        let assignment = solve(&cost);
        // Exactly one row is matched to the single column, and it must be
        // the cheapest one.
        let matched: Vec<usize> = assignment.iter().filter_map(|x| *x).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(assignment[1], Some(0));
    }

    #[test]
    fn test_sentinel_blocks_infeasible_pairing() {
        let cost = vec![vec![SENTINEL, 5.0], vec![5.0, SENTINEL]];
        let assignment = solve(&cost);
        assert_eq!(assignment, vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_all_infeasible_leaves_rows_unmatched() {
        let cost = vec![vec![SENTINEL, SENTINEL], vec![SENTINEL, SENTINEL]];
        let assignment = solve(&cost);
        assert_eq!(assignment, vec![None, None]);
    }
}
