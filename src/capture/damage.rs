//! Coalesces dirty 128x128 blocks into damage rectangles.
//!
//! 4-connected components over the diff map via union-find, each root
//! carrying the bounding box of its component. Bounding-box union is lossy
//! but keeps the one property the client depends on: the emitted rectangles
//! cover every dirty block.

use crate::capture::diff::{DiffMap, BLOCK_SIZE};
use crate::KVMFR::Structs::KVMFR_Structs::{FrameDamageRect, KVMFR_MAX_DAMAGE_RECTS};

#[derive(Clone, Copy, Default)]
struct DsNode {
    id: u32,
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
}

/// Reusable extractor. The disjoint-set scratch grows to the largest map
/// seen and is then reused, so steady-state extraction does not allocate.
pub struct DamageExtractor {
    nodes: Vec<DsNode>,
}

impl Default for DamageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn find(nodes: &mut [DsNode], mut i: u32) -> u32 {
    // path halving
    while nodes[i as usize].id != i {
        let parent = nodes[i as usize].id;
        nodes[i as usize].id = nodes[parent as usize].id;
        i = nodes[i as usize].id;
    }
    i
}

fn union(nodes: &mut [DsNode], a: u32, b: u32) {
    let a = find(nodes, a);
    let b = find(nodes, b);
    if a == b {
        return;
    }

    nodes[b as usize].id = a;
    let merged = nodes[b as usize];
    let root = &mut nodes[a as usize];
    root.x1 = root.x1.min(merged.x1);
    root.x2 = root.x2.max(merged.x2);
    root.y1 = root.y1.min(merged.y1);
    root.y2 = root.y2.max(merged.y2);
}

impl DamageExtractor {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Coalesce `map` into `rects`, returning the rectangle count in pixel
    /// units. Returns 0 when the component count exceeds the rectangle
    /// budget, meaning "assume the entire frame changed"; a truncated set
    /// is never emitted.
    pub fn extract(
        &mut self,
        map: &DiffMap,
        rects: &mut [FrameDamageRect; KVMFR_MAX_DAMAGE_RECTS],
    ) -> usize {
        let w = map.width();
        let h = map.height();
        let cells = w as usize * h as usize;
        if cells == 0 {
            return 0;
        }
        if self.nodes.len() < cells {
            self.nodes.resize(cells, DsNode::default());
        }
        let nodes = &mut self.nodes[..cells];

        for y in 0..h {
            for x in 0..w {
                if !map.dirty(x, y) {
                    continue;
                }
                let i = y * w + x;
                nodes[i as usize] = DsNode {
                    id: i,
                    x1: x,
                    x2: x,
                    y1: y,
                    y2: y,
                };

                if y > 0 && map.dirty(x, y - 1) {
                    union(nodes, (y - 1) * w + x, i);
                }
                if x > 0 && map.dirty(x - 1, y) {
                    union(nodes, i, i - 1);
                }
            }
        }

        let mut count = 0;
        for y in 0..h {
            for x in 0..w {
                let i = y * w + x;
                if !map.dirty(x, y) || nodes[i as usize].id != i {
                    continue;
                }
                if count == KVMFR_MAX_DAMAGE_RECTS {
                    return 0;
                }

                let n = &nodes[i as usize];
                rects[count] = FrameDamageRect {
                    x: n.x1 * BLOCK_SIZE,
                    y: n.y1 * BLOCK_SIZE,
                    width: (n.x2 - n.x1 + 1) * BLOCK_SIZE,
                    height: (n.y2 - n.y1 + 1) * BLOCK_SIZE,
                };
                count += 1;
            }
        }
        count
    }
}
