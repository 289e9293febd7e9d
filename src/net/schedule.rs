//! Layer discovery and execution order.

use crate::error::{Error, Result};
use crate::layers::{Layer, LayerId};

/// Depth-first pre-order walk from `roots` along child edges.
///
/// Every reachable layer appears once, at its first visit.
pub(crate) fn discover(layers: &[Layer], roots: &[LayerId]) -> Vec<LayerId> {
    let mut seen = vec![false; layers.len()];
    let mut order = Vec::new();
    for &root in roots {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            order.push(id);
            stack.extend(layers[id.0].children.iter().rev().copied());
        }
    }
    order
}

/// Topological order over `layers`, where a layer becomes ready once
/// `deps(layer)` of its edges have been consumed.
///
/// Ties go to the layer with the lowest index, so the result is
/// deterministic for a given arena.
fn kahn(
    layers: &[Layer],
    component: &'static str,
    degree: impl Fn(&Layer) -> usize,
    next: impl Fn(&Layer) -> &[LayerId],
) -> Result<Vec<LayerId>> {
    let n = layers.len();
    let mut pending: Vec<usize> = layers.iter().map(&degree).collect();
    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);

    for _ in 0..n {
        let Some(j) = (0..n).find(|&j| !done[j] && pending[j] == 0) else {
            return Err(Error::RecurrentNet {
                component,
                remaining: n - order.len(),
            });
        };
        done[j] = true;
        order.push(LayerId(j));
        for &k in next(&layers[j]) {
            pending[k.0] = pending[k.0].saturating_sub(1);
        }
    }
    Ok(order)
}

/// Forward schedule: every layer after all of its parents.
pub(crate) fn forward_order(layers: &[Layer]) -> Result<Vec<LayerId>> {
    kahn(layers, "fts", |l| l.parents.len(), |l| &l.children)
}

/// Backward schedule: every layer after all of its children.
pub(crate) fn backward_order(layers: &[Layer]) -> Result<Vec<LayerId>> {
    kahn(layers, "bts", |l| l.children.len(), |l| &l.parents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn position(order: &[LayerId], id: LayerId) -> usize {
        order.iter().position(|&x| x == id).unwrap()
    }

    #[test]
    fn diamond_orders() {
        let mut g = Graph::with_seed(0);
        let x = g.input("x", &[3]).unwrap();
        let a = g.relu("a", x).unwrap();
        let b = g.sigmoid("b", x).unwrap();
        let s = g.add("s", &[a, b]).unwrap();
        let layers = g.into_layers();

        assert_eq!(discover(&layers, &[x]), vec![x, a, s, b]);

        let fts = forward_order(&layers).unwrap();
        assert_eq!(fts, vec![x, a, b, s]);
        let bts = backward_order(&layers).unwrap();
        assert_eq!(bts[0], s);
        assert!(position(&bts, a) < position(&bts, x));
        assert!(position(&bts, b) < position(&bts, x));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = Graph::with_seed(0);
        let x = g.input("x", &[2]).unwrap();
        let s = g.add("s", &[x]).unwrap();
        let r = g.relu("r", s).unwrap();
        g.link(r, s).unwrap();
        let layers = g.into_layers();
        assert!(matches!(forward_order(&layers), Err(Error::RecurrentNet { .. })));
        assert!(matches!(backward_order(&layers), Err(Error::RecurrentNet { .. })));
    }
}
