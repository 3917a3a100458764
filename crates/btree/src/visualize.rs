//! Depth-first tree dump for debugging. Not required for correctness: the
//! tree's durability and ordering guarantees never depend on this module.

use common::{BpResult, Offset};

use crate::engine::BpTree;

const MAX_DEPTH: usize = 10;

impl BpTree {
    /// Render the tree depth-first, indenting each node by its level.
    /// Logs every line at `debug` level and also returns them so a caller
    /// (the CLI's `visualize` subcommand) can print directly to stdout.
    pub fn visualize(&self) -> BpResult<Vec<String>> {
        let mut lines = Vec::new();

        if self.is_empty() {
            lines.push("(empty tree)".to_string());
            for line in &lines {
                log::debug!("{line}");
            }
            return Ok(lines);
        }

        // Explicit stack of (offset, depth) pairs acts as the sibling
        // backlog: popping resumes at the next unvisited sibling of the
        // deepest unfinished ancestor once a branch bottoms out.
        let mut backlog: Vec<(Offset, usize)> = vec![(self.root_offset(), 0)];

        while let Some((offset, depth)) = backlog.pop() {
            let node = self.node(offset)?;

            if node.is_leaf() {
                let keys: Vec<String> = (0..node.children()).map(|i| node.key(i).to_string()).collect();
                lines.push(format!("{}leaf@{offset:#x} [{}]", indent(depth), keys.join(", ")));
            } else {
                let keys: Vec<String> = (0..node.children().saturating_sub(1))
                    .map(|i| node.key(i).to_string())
                    .collect();
                lines.push(format!("{}internal@{offset:#x} [{}]", indent(depth), keys.join(", ")));

                if depth < MAX_DEPTH {
                    for i in (0..node.children()).rev() {
                        backlog.push((node.sub(i), depth + 1));
                    }
                } else {
                    lines.push(format!("{}... (max depth reached)", indent(depth + 1)));
                }
            }
        }

        for line in &lines {
            log::debug!("{line}");
        }
        Ok(lines)
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}
