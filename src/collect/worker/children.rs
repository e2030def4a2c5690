use crate::collect::item::{ChildNode, FlatChild, WorkItem};
use crate::source::RequestScope;
use anyhow::Result;

use super::process::Worker;

struct Pending {
    node: ChildNode,
    parent_id: String,
    depth: u32,
}

impl Worker {
    /// Flattens a reply tree in pre-order with an explicit stack.
    ///
    /// Deferred placeholders are expanded in place (their children take the placeholder's parent
    /// and depth) until `max_child_pages` expansions have been spent; later placeholders are
    /// dropped. The heartbeat is refreshed after every expansion.
    pub(super) async fn flatten_children(
        &self,
        item: &WorkItem,
        roots: Vec<ChildNode>,
        scope: RequestScope<'_>,
    ) -> Result<Vec<FlatChild>> {
        let mut flattened = Vec::new();
        let mut pages_fetched = 0usize;
        let mut skipped_pages = 0usize;
        let mut stack: Vec<Pending> = Vec::new();
        push_reversed(&mut stack, roots, item.id(), 0);

        while let Some(Pending {
            node,
            parent_id,
            depth,
        }) = stack.pop()
        {
            match node {
                ChildNode::Loaded {
                    id,
                    fields,
                    replies,
                } => {
                    push_reversed(&mut stack, replies, &id, depth + 1);
                    flattened.push(FlatChild {
                        id,
                        parent_id,
                        depth,
                        fields,
                    });
                }
                ChildNode::Deferred { cursor } => {
                    if pages_fetched >= self.max_child_pages {
                        skipped_pages += 1;
                        continue;
                    }
                    pages_fetched += 1;
                    let expanded = self.client.fetch_child_page(item, &cursor, scope).await?;
                    self.pulse();
                    push_reversed(&mut stack, expanded, &parent_id, depth);
                }
            }
        }

        if skipped_pages > 0 {
            tracing::debug!(
                worker = self.id,
                item_id = item.id(),
                pages_fetched,
                skipped_pages,
                "child page budget exhausted; remaining placeholders dropped"
            );
        }

        Ok(flattened)
    }
}

fn push_reversed(stack: &mut Vec<Pending>, nodes: Vec<ChildNode>, parent_id: &str, depth: u32) {
    for node in nodes.into_iter().rev() {
        stack.push(Pending {
            node,
            parent_id: parent_id.to_owned(),
            depth,
        });
    }
}
