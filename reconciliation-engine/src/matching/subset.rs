//! Bounded subset-sum search used by the one-to-many and many-to-one passes.

/// Outcome of one bounded search. Solutions are index sets into the input slice,
/// best first: smallest absolute delta, then fewest members, then lowest indices.
#[derive(Debug, Default)]
pub struct SubsetSearch {
    pub solutions: Vec<Vec<usize>>,
    pub nodes_visited: u64,
    pub nodes_pruned: u64,
    pub cap_hit: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchBounds {
    pub min_size: usize,
    pub max_size: usize,
    pub max_nodes: usize,
    pub max_solutions: usize,
}

struct Dfs<'a> {
    amounts: &'a [i64],
    order: Vec<usize>,
    suffix: Vec<i64>,
    target: i64,
    tolerance: i64,
    bounds: SearchBounds,
    stack: Vec<usize>,
    found: Vec<(i64, Vec<usize>)>,
    nodes_visited: u64,
    nodes_pruned: u64,
    cap_hit: bool,
}

impl Dfs<'_> {
    fn visit(&mut self, start: usize, sum: i64) {
        if self.cap_hit {
            return;
        }

        self.nodes_visited += 1;
        if self.nodes_visited >= self.bounds.max_nodes as u64 {
            self.cap_hit = true;
            return;
        }

        let delta = (sum - self.target).abs();
        if self.stack.len() >= self.bounds.min_size && delta <= self.tolerance {
            self.record(delta);
        }

        if self.stack.len() >= self.bounds.max_size {
            self.nodes_pruned += 1;
            return;
        }

        for k in start..self.order.len() {
            // Amounts are sorted descending, so the best this branch can still
            // reach only shrinks as k grows.
            if sum + self.suffix[k] < self.target - self.tolerance {
                self.nodes_pruned += 1;
                break;
            }
            let next = sum + self.amounts[self.order[k]];
            if next > self.target + self.tolerance {
                self.nodes_pruned += 1;
                continue;
            }

            self.stack.push(self.order[k]);
            self.visit(k + 1, next);
            self.stack.pop();

            if self.cap_hit {
                return;
            }
        }
    }

    fn record(&mut self, delta: i64) {
        let mut members = self.stack.clone();
        members.sort_unstable();
        self.found.push((delta, members));

        if self.found.len() > self.bounds.max_solutions * 4 {
            self.settle();
        }
    }

    fn settle(&mut self) {
        self.found
            .sort_by(|a, b| a.0.cmp(&b.0).then(a.1.len().cmp(&b.1.len())).then(a.1.cmp(&b.1)));
        self.found.dedup_by(|a, b| a.1 == b.1);
        self.found.truncate(self.bounds.max_solutions);
    }
}

/// Find index sets of `amounts` whose sum lands within `tolerance` of `target`.
/// Non-positive amounts are ignored.
pub fn subset_sum_search(
    amounts: &[i64],
    target: i64,
    tolerance: i64,
    bounds: SearchBounds,
) -> SubsetSearch {
    if target <= 0 || bounds.max_solutions == 0 || bounds.max_size == 0 {
        return SubsetSearch::default();
    }

    let mut order: Vec<usize> = (0..amounts.len()).filter(|&i| amounts[i] > 0).collect();
    order.sort_by(|&a, &b| amounts[b].cmp(&amounts[a]).then(a.cmp(&b)));

    let mut suffix = vec![0i64; order.len() + 1];
    for k in (0..order.len()).rev() {
        suffix[k] = suffix[k + 1] + amounts[order[k]];
    }

    let mut dfs = Dfs {
        amounts,
        order,
        suffix,
        target,
        tolerance: tolerance.max(0),
        bounds,
        stack: Vec::new(),
        found: Vec::new(),
        nodes_visited: 0,
        nodes_pruned: 0,
        cap_hit: false,
    };
    dfs.visit(0, 0);
    dfs.settle();

    SubsetSearch {
        solutions: dfs.found.into_iter().map(|(_, members)| members).collect(),
        nodes_visited: dfs.nodes_visited,
        nodes_pruned: dfs.nodes_pruned,
        cap_hit: dfs.cap_hit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(max_size: usize) -> SearchBounds {
        SearchBounds {
            min_size: 2,
            max_size,
            max_nodes: 10_000,
            max_solutions: 8,
        }
    }

    #[test]
    fn prefers_exact_then_smaller() {
        let amounts = [500, 300, 200, 700];
        let result = subset_sum_search(&amounts, 1000, 0, bounds(5));
        assert_eq!(result.solutions[0], vec![1, 3]);
        assert!(result.solutions.contains(&vec![0, 1, 2]));
        assert!(!result.cap_hit);
    }

    #[test]
    fn respects_size_bound() {
        let amounts = [250, 250, 250, 250];
        assert!(subset_sum_search(&amounts, 1000, 0, bounds(3)).solutions.is_empty());
        assert_eq!(
            subset_sum_search(&amounts, 1000, 0, bounds(4)).solutions,
            vec![vec![0, 1, 2, 3]]
        );
    }

    #[test]
    fn single_members_are_not_subsets() {
        let amounts = [1000, 10];
        assert!(subset_sum_search(&amounts, 1000, 0, bounds(5)).solutions.is_empty());
    }

    #[test]
    fn tolerance_admits_near_sums() {
        let amounts = [495, 500, 10_000];
        let result = subset_sum_search(&amounts, 1000, 20, bounds(5));
        assert_eq!(result.solutions, vec![vec![0, 1]]);
    }

    #[test]
    fn node_cap_stops_search() {
        let amounts: Vec<i64> = (1..=40).collect();
        let result = subset_sum_search(
            &amounts,
            100,
            0,
            SearchBounds {
                min_size: 2,
                max_size: 5,
                max_nodes: 50,
                max_solutions: 3,
            },
        );
        assert!(result.cap_hit);
        assert!(result.solutions.len() <= 3);
    }
}
