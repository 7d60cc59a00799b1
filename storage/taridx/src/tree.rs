//! The on-disk B-tree.
//!
//! Nodes are [`BlockStore`] pages: leaves hold `(name, offset, size)`
//! records, internal nodes hold `(separator, child-block)` pairs where
//! the separator is the smallest key in the child's subtree. There is no
//! sentinel rightmost child — an internal node with `k` items has `k`
//! children. The root always lives at logical block 1 and the tree grows
//! at the root.
//!
//! Splits allocate *fresh* blocks for both halves and the parent is
//! written last. A reader that still holds a pre-split parent therefore
//! descends into the abandoned block, which keeps serving the intact
//! pre-split subtree; it never sees a half-updated page.

use std::path::Path;

use futures::{future::BoxFuture, FutureExt};

use crate::{
    block::{ChildRecord, MemberRecord, NodeItems, NodeRecord},
    store::{BlockStore, Geometry},
    Error, Mode,
};

/// Where a member's payload lives in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the first payload byte.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
}

/// Tree opening knobs.
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Park dirty pages until [`BlockTree::flush`] instead of writing
    /// through on every change.
    pub write_back: bool,
    /// Replace the record when inserting an existing name; disabled,
    /// such an insert fails with [`Error::Duplicate`].
    pub overwrite: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            write_back: false,
            overwrite: true,
        }
    }
}

/// A B-tree of member records over a [`BlockStore`].
pub struct BlockTree {
    store: BlockStore,
    root: Node,
    overwrite: bool,
}

impl BlockTree {
    /// Create an empty tree file.
    pub async fn create(path: impl AsRef<Path>, geometry: Geometry) -> Result<(), Error> {
        BlockStore::create(path, geometry).await
    }

    /// Open an existing tree file and load its root.
    pub async fn open(
        path: impl AsRef<Path>,
        mode: Mode,
        options: TreeOptions,
    ) -> Result<Self, Error> {
        let mut store = BlockStore::open(path, mode, options.write_back).await?;
        let root = Node::from_record(store.read_block(1).await?);
        Ok(Self {
            store,
            root,
            overwrite: options.overwrite,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.store.geometry()
    }

    /// Insert a member record, descending to the right leaf and splitting
    /// back up as needed.
    pub async fn insert(&mut self, name: &str, offset: u64, size: u64) -> Result<(), Error> {
        let geometry = self.store.geometry();
        if name.len() > geometry.max_name_len {
            return Err(Error::NameTooLong {
                length: name.len(),
                limit: geometry.max_name_len,
            });
        }
        if name.contains('\n') {
            return Err(Error::InvalidName);
        }

        let root_block = self.root.block_no;
        let record = MemberRecord::new(name, offset, size);
        let outcome = insert_node(&mut self.root, &mut self.store, self.overwrite, record).await?;

        if let Some(right) = outcome.split {
            // Height grows here: the halves got fresh blocks, the new
            // root reclaims block 1. If the old root was anywhere else
            // the structure is already broken.
            if root_block != 1 {
                return Err(Error::CorruptTree {
                    reason: "pre-split root was not block 1",
                });
            }
            let left = std::mem::replace(
                &mut self.root,
                Node {
                    block_no: 0,
                    entries: NodeEntries::Leaf(Vec::new()),
                },
            );
            let root = Node {
                block_no: 1,
                entries: NodeEntries::Internal(vec![
                    ChildSlot::filled(left)?,
                    ChildSlot::filled(right)?,
                ]),
            };
            self.store.set_dirty(root.to_record()).await?;
            self.root = root;
        }
        Ok(())
    }

    /// Look up a member by name.
    pub async fn lookup(&mut self, name: &str) -> Result<IndexEntry, Error> {
        lookup_node(&mut self.root, &mut self.store, name).await
    }

    /// The last item of the rightmost leaf; `None` on an empty tree.
    pub async fn last_leaf_entry(&mut self) -> Result<Option<MemberRecord>, Error> {
        last_node(&mut self.root, &mut self.store).await
    }

    /// Verify node ordering and the separator/child-first-key invariant.
    /// With `deep`, children are loaded from disk; otherwise only the
    /// already-cached part of the tree is checked.
    pub async fn check(&mut self, deep: bool) -> Result<(), Error> {
        check_node(&mut self.root, &mut self.store, deep).await
    }

    /// Write out parked pages, drop the cached subtree, and reload the
    /// root. Bounds memory during long insert runs.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.store.flush().await?;
        self.root = Node::from_record(self.store.read_block(1).await?);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &BlockStore {
        &self.store
    }
}

/// A child pointer with its separator and, once visited, the child node
/// itself. Children are loaded lazily on descent and dropped on
/// [`BlockTree::flush`].
struct ChildSlot {
    key: String,
    block_no: u64,
    node: Option<Box<Node>>,
}

impl ChildSlot {
    fn filled(node: Node) -> Result<Self, Error> {
        Ok(Self {
            key: node.first_key()?.to_owned(),
            block_no: node.block_no,
            node: Some(Box::new(node)),
        })
    }
}

enum NodeEntries {
    Leaf(Vec<MemberRecord>),
    Internal(Vec<ChildSlot>),
}

struct Node {
    block_no: u64,
    entries: NodeEntries,
}

impl Node {
    fn from_record(record: NodeRecord) -> Self {
        let entries = match record.items {
            NodeItems::Leaf(items) => NodeEntries::Leaf(items),
            NodeItems::Children(items) => NodeEntries::Internal(
                items
                    .into_iter()
                    .map(|item| ChildSlot {
                        key: item.key,
                        block_no: item.child,
                        node: None,
                    })
                    .collect(),
            ),
        };
        Self {
            block_no: record.block_no,
            entries,
        }
    }

    fn to_record(&self) -> NodeRecord {
        let items = match &self.entries {
            NodeEntries::Leaf(items) => NodeItems::Leaf(items.clone()),
            NodeEntries::Internal(slots) => NodeItems::Children(
                slots
                    .iter()
                    .map(|slot| ChildRecord {
                        key: slot.key.clone(),
                        child: slot.block_no,
                    })
                    .collect(),
            ),
        };
        NodeRecord {
            block_no: self.block_no,
            items,
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            NodeEntries::Leaf(items) => items.len(),
            NodeEntries::Internal(slots) => slots.len(),
        }
    }

    fn key_at(&self, index: usize) -> &str {
        match &self.entries {
            NodeEntries::Leaf(items) => &items[index].name,
            NodeEntries::Internal(slots) => &slots[index].key,
        }
    }

    fn first_key(&self) -> Result<&str, Error> {
        if self.len() == 0 {
            return Err(Error::CorruptTree {
                reason: "empty node has no first key",
            });
        }
        Ok(self.key_at(0))
    }
}

/// Smallest index whose key is strictly greater than `key`. Linear scan
/// for short item lists, binary search above that.
fn upper_bound<T>(items: &[T], key: &str, item_key: impl Fn(&T) -> &str) -> usize {
    if items.len() < 8 {
        items
            .iter()
            .position(|item| key < item_key(item))
            .unwrap_or(items.len())
    } else {
        let (mut low, mut high) = (0, items.len());
        while low < high {
            let mid = (low + high) / 2;
            if key < item_key(&items[mid]) {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        low
    }
}

struct InsertOutcome {
    /// The node's first key changed; the parent must refresh the
    /// separator and, if this was its leftmost child, report upward.
    new_min: bool,
    /// The node split; the right sibling must be linked by the parent.
    /// The node itself carries a fresh block number.
    split: Option<Node>,
}

fn insert_node<'a>(
    node: &'a mut Node,
    store: &'a mut BlockStore,
    overwrite: bool,
    record: MemberRecord,
) -> BoxFuture<'a, Result<InsertOutcome, Error>> {
    async move {
        if let NodeEntries::Leaf(_) = node.entries {
            let new_min = {
                let NodeEntries::Leaf(items) = &mut node.entries else {
                    unreachable!("checked above");
                };
                let index = upper_bound(items, &record.name, |item| item.name.as_str());
                if index > 0 && items[index - 1].name == record.name {
                    if !overwrite {
                        return Err(Error::Duplicate { name: record.name });
                    }
                    items[index - 1] = record;
                    false
                } else {
                    items.insert(index, record);
                    index == 0 && items.len() > 1
                }
            };
            store.set_dirty(node.to_record()).await?;
            let split = adjust(node, store).await?;
            return Ok(InsertOutcome { new_min, split });
        }

        // Internal: descend into the child whose range covers the key.
        // Keys below the first separator still go to the leftmost child;
        // the separator is corrected on the way back up.
        let child_index = {
            let NodeEntries::Internal(slots) = &node.entries else {
                unreachable!("leaf handled above");
            };
            upper_bound(slots, &record.name, |slot| slot.key.as_str()).max(1) - 1
        };
        load_child(node, store, child_index).await?;

        let outcome = {
            let NodeEntries::Internal(slots) = &mut node.entries else {
                unreachable!("leaf handled above");
            };
            let Some(child) = slots[child_index].node.as_deref_mut() else {
                return Err(Error::CorruptTree {
                    reason: "child vanished during descent",
                });
            };
            insert_node(child, store, overwrite, record).await?
        };

        let mut changed = false;
        {
            let NodeEntries::Internal(slots) = &mut node.entries else {
                unreachable!("leaf handled above");
            };
            if let Some(right) = outcome.split {
                // The left half was republished under a fresh block; the
                // entry must follow it or the split is lost on reopen.
                let left_block = match slots[child_index].node.as_deref() {
                    Some(child) => child.block_no,
                    None => {
                        return Err(Error::CorruptTree {
                            reason: "child vanished during split",
                        })
                    }
                };
                slots[child_index].block_no = left_block;
                let right_key = right.first_key()?.to_owned();
                let position = upper_bound(slots, &right_key, |slot| slot.key.as_str());
                slots.insert(
                    position,
                    ChildSlot {
                        key: right_key,
                        block_no: right.block_no,
                        node: Some(Box::new(right)),
                    },
                );
                changed = true;
            }
            if outcome.new_min {
                let first = match slots[child_index].node.as_deref() {
                    Some(child) => child.first_key()?.to_owned(),
                    None => {
                        return Err(Error::CorruptTree {
                            reason: "child vanished during descent",
                        })
                    }
                };
                slots[child_index].key = first;
                changed = true;
            }
        }

        if !changed {
            return Ok(InsertOutcome {
                new_min: false,
                split: None,
            });
        }
        store.set_dirty(node.to_record()).await?;
        let split = adjust(node, store).await?;
        Ok(InsertOutcome {
            new_min: outcome.new_min && child_index == 0,
            split,
        })
    }
    .boxed()
}

/// Split when the item budget or the free-space headroom is exhausted.
/// Returns the right sibling, already written; the left half is written
/// here as well, so by the time the caller links the halves both are
/// durable.
async fn adjust(node: &mut Node, store: &mut BlockStore) -> Result<Option<Node>, Error> {
    let geometry = store.geometry();
    let free = geometry
        .block_size
        .saturating_sub(node.to_record().store_size());
    if node.len() < geometry.max_items && free >= geometry.max_rec_len {
        return Ok(None);
    }

    let mid = node.len() / 2;
    let right_entries = match &mut node.entries {
        NodeEntries::Leaf(items) => NodeEntries::Leaf(items.split_off(mid)),
        NodeEntries::Internal(slots) => NodeEntries::Internal(slots.split_off(mid)),
    };
    // Both halves move to fresh blocks; the abandoned block keeps its
    // pre-split content for readers still holding the old parent. A block
    // that was never written has no readers and may keep its number —
    // reallocating it would leave a hole the extend-by-one write protocol
    // cannot cross.
    if node.block_no <= store.last_block() {
        store.forget(node.block_no);
        node.block_no = store.allocate_block();
    }
    let right = Node {
        block_no: store.allocate_block(),
        entries: right_entries,
    };
    store.set_dirty(node.to_record()).await?;
    store.set_dirty(right.to_record()).await?;
    Ok(Some(right))
}

async fn load_child(node: &mut Node, store: &mut BlockStore, index: usize) -> Result<(), Error> {
    let NodeEntries::Internal(slots) = &mut node.entries else {
        return Err(Error::CorruptTree {
            reason: "descent into a leaf",
        });
    };
    if slots[index].node.is_none() {
        let record = store.read_block(slots[index].block_no).await?;
        slots[index].node = Some(Box::new(Node::from_record(record)));
    }
    Ok(())
}

fn lookup_node<'a>(
    node: &'a mut Node,
    store: &'a mut BlockStore,
    name: &'a str,
) -> BoxFuture<'a, Result<IndexEntry, Error>> {
    async move {
        match &node.entries {
            NodeEntries::Leaf(items) => {
                let index = upper_bound(items, name, |item| item.name.as_str());
                if index > 0 && items[index - 1].name == name {
                    Ok(IndexEntry {
                        offset: items[index - 1].offset,
                        size: items[index - 1].size,
                    })
                } else {
                    Err(Error::NotFound {
                        name: name.to_owned(),
                    })
                }
            }
            NodeEntries::Internal(slots) => {
                let index = upper_bound(slots, name, |slot| slot.key.as_str());
                if index == 0 {
                    return Err(Error::NotFound {
                        name: name.to_owned(),
                    });
                }
                load_child(node, store, index - 1).await?;
                let NodeEntries::Internal(slots) = &mut node.entries else {
                    unreachable!("matched above");
                };
                let Some(child) = slots[index - 1].node.as_deref_mut() else {
                    return Err(Error::CorruptTree {
                        reason: "child vanished during descent",
                    });
                };
                lookup_node(child, store, name).await
            }
        }
    }
    .boxed()
}

fn last_node<'a>(
    node: &'a mut Node,
    store: &'a mut BlockStore,
) -> BoxFuture<'a, Result<Option<MemberRecord>, Error>> {
    async move {
        match &node.entries {
            NodeEntries::Leaf(items) => Ok(items.last().cloned()),
            NodeEntries::Internal(slots) => {
                if slots.is_empty() {
                    return Err(Error::CorruptTree {
                        reason: "internal node without children",
                    });
                }
                let index = slots.len() - 1;
                load_child(node, store, index).await?;
                let NodeEntries::Internal(slots) = &mut node.entries else {
                    unreachable!("matched above");
                };
                let Some(child) = slots[index].node.as_deref_mut() else {
                    return Err(Error::CorruptTree {
                        reason: "child vanished during descent",
                    });
                };
                last_node(child, store).await
            }
        }
    }
    .boxed()
}

fn check_node<'a>(
    node: &'a mut Node,
    store: &'a mut BlockStore,
    deep: bool,
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        for index in 1..node.len() {
            if node.key_at(index - 1) >= node.key_at(index) {
                return Err(Error::CorruptTree {
                    reason: "node keys out of order",
                });
            }
        }
        if matches!(node.entries, NodeEntries::Leaf(_)) {
            return Ok(());
        }
        for index in 0..node.len() {
            if deep {
                load_child(node, store, index).await?;
            }
            let next_key = {
                let NodeEntries::Internal(slots) = &node.entries else {
                    unreachable!("leaf handled above");
                };
                slots.get(index + 1).map(|slot| slot.key.clone())
            };
            let NodeEntries::Internal(slots) = &mut node.entries else {
                unreachable!("leaf handled above");
            };
            let separator = slots[index].key.clone();
            let Some(child) = slots[index].node.as_deref_mut() else {
                // Not loaded and not asked to load: skip, like a shallow
                // check of a partially cached tree.
                continue;
            };
            if child.first_key()? != separator {
                return Err(Error::CorruptTree {
                    reason: "separator does not match child's first key",
                });
            }
            if let Some(next_key) = next_key {
                if child.key_at(child.len() - 1) >= next_key.as_str() {
                    return Err(Error::CorruptTree {
                        reason: "child keys reach past the next separator",
                    });
                }
            }
            check_node(child, store, deep).await?;
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::tempdir;

    use super::{BlockTree, TreeOptions};
    use crate::{store::Geometry, Error, Mode};

    async fn fresh_tree(dir: &tempfile::TempDir, geometry: Geometry) -> BlockTree {
        let path = dir.path().join("index.pytree");
        BlockTree::create(&path, geometry).await.unwrap();
        BlockTree::open(&path, Mode::ReadWrite, TreeOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let dir = tempdir().unwrap();
        let mut tree = fresh_tree(&dir, Geometry::default()).await;

        tree.insert("beta", 512, 10).await.unwrap();
        tree.insert("alpha", 1536, 20).await.unwrap();
        tree.insert("gamma", 2560, 30).await.unwrap();

        assert_eq!(tree.lookup("alpha").await.unwrap().offset, 1536);
        assert_eq!(tree.lookup("beta").await.unwrap().size, 10);
        assert_eq!(tree.lookup("gamma").await.unwrap().offset, 2560);
        assert!(matches!(
            tree.lookup("delta").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_without_overwrite_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.pytree");
        BlockTree::create(&path, Geometry::default()).await.unwrap();
        let mut tree = BlockTree::open(
            &path,
            Mode::ReadWrite,
            TreeOptions {
                overwrite: false,
                ..TreeOptions::default()
            },
        )
        .await
        .unwrap();

        tree.insert("alpha", 512, 10).await.unwrap();
        assert!(matches!(
            tree.insert("alpha", 9999, 1).await,
            Err(Error::Duplicate { .. })
        ));
        assert_eq!(tree.lookup("alpha").await.unwrap().offset, 512);
    }

    #[tokio::test]
    async fn overwrite_shadows_previous_record() {
        let dir = tempdir().unwrap();
        let mut tree = fresh_tree(&dir, Geometry::default()).await;

        tree.insert("alpha", 512, 10).await.unwrap();
        tree.insert("alpha", 4096, 77).await.unwrap();
        let entry = tree.lookup("alpha").await.unwrap();
        assert_eq!((entry.offset, entry.size), (4096, 77));
    }

    #[tokio::test]
    async fn name_length_is_bounded() {
        let dir = tempdir().unwrap();
        let mut tree = fresh_tree(&dir, Geometry::default()).await;

        let exact = "x".repeat(160);
        tree.insert(&exact, 512, 1).await.unwrap();
        assert_eq!(tree.lookup(&exact).await.unwrap().offset, 512);

        let over = "x".repeat(161);
        assert!(matches!(
            tree.insert(&over, 512, 1).await,
            Err(Error::NameTooLong {
                length: 161,
                limit: 160
            })
        ));
        assert!(matches!(
            tree.insert("new\nline", 512, 1).await,
            Err(Error::InvalidName)
        ));
    }

    #[tokio::test]
    async fn item_budget_split_uses_fresh_blocks() {
        let dir = tempdir().unwrap();
        let geometry = Geometry {
            block_size: 4096,
            max_items: 8,
            ..Geometry::default()
        };
        let mut tree = fresh_tree(&dir, geometry).await;

        for i in 0..7 {
            tree.insert(&format!("key-{i:02}"), 512 * (i + 1), 10)
                .await
                .unwrap();
        }
        assert_eq!(tree.store().free_block(), 2);

        // the eighth item reaches max_items and forces the root split;
        // the halves land on the two freshly allocated blocks
        tree.insert("key-07", 512 * 8, 10).await.unwrap();
        assert_eq!(tree.store().free_block(), 4);
        assert_eq!(tree.root.block_no, 1);
        assert_eq!(tree.root.len(), 2);

        tree.check(true).await.unwrap();
        for i in 0..8 {
            assert!(tree.lookup(&format!("key-{i:02}")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn space_exhaustion_split() {
        let dir = tempdir().unwrap();
        // default geometry: 1024-byte blocks overflow long before 100 items
        let mut tree = fresh_tree(&dir, Geometry::default()).await;

        for i in 0..60 {
            tree.insert(&format!("member-{i:04}"), 512 * (i + 1), 64)
                .await
                .unwrap();
        }
        assert!(tree.store().free_block() > 2);
        tree.check(true).await.unwrap();
        for i in 0..60 {
            assert!(tree.lookup(&format!("member-{i:04}")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn smallest_key_propagates_separators() {
        let dir = tempdir().unwrap();
        let geometry = Geometry {
            block_size: 4096,
            max_items: 4,
            ..Geometry::default()
        };
        let mut tree = fresh_tree(&dir, geometry).await;

        // grow a few levels, then insert a key below everything
        for i in 0..40 {
            tree.insert(&format!("m-{:03}", i + 100), 512, 1).await.unwrap();
        }
        tree.insert("a-000", 512, 1).await.unwrap();

        // the deep check verifies every ancestor separator equals its
        // child's first key, which is exactly what the propagation must
        // have maintained
        tree.check(true).await.unwrap();
        assert_eq!(tree.lookup("a-000").await.unwrap().offset, 512);
        assert_eq!(
            tree.last_leaf_entry().await.unwrap().unwrap().name,
            "m-139"
        );
    }

    #[tokio::test]
    async fn empty_tree_has_no_last_entry() {
        let dir = tempdir().unwrap();
        let mut tree = fresh_tree(&dir, Geometry::default()).await;
        assert!(tree.last_leaf_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn random_bulk_insert_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.pytree");
        BlockTree::create(&path, Geometry::default()).await.unwrap();
        let mut tree = BlockTree::open(&path, Mode::ReadWrite, TreeOptions::default())
            .await
            .unwrap();

        let mut rng = StdRng::seed_from_u64(263_541);
        let mut names = Vec::new();
        for i in 0..2000u64 {
            let name = format!("{:.12}", rng.gen::<f64>());
            tree.insert(&name, i, i * i).await.unwrap();
            names.push(name);
        }
        tree.check(true).await.unwrap();
        drop(tree);

        let mut tree = BlockTree::open(&path, Mode::Read, TreeOptions::default())
            .await
            .unwrap();
        tree.check(true).await.unwrap();
        for (i, name) in names.iter().enumerate() {
            let entry = tree.lookup(name).await.unwrap();
            assert_eq!(entry.offset, i as u64);
            assert_eq!(entry.size, (i * i) as u64);
        }

        let expected_last = names.iter().max().unwrap();
        assert_eq!(
            &tree.last_leaf_entry().await.unwrap().unwrap().name,
            expected_last
        );
    }

    #[tokio::test]
    async fn write_back_flush_bounds_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.pytree");
        BlockTree::create(&path, Geometry::default()).await.unwrap();
        let mut tree = BlockTree::open(
            &path,
            Mode::ReadWrite,
            TreeOptions {
                write_back: true,
                ..TreeOptions::default()
            },
        )
        .await
        .unwrap();

        for i in 0..100 {
            tree.insert(&format!("obj-{i:03}"), 512 * (i + 1), 32)
                .await
                .unwrap();
            if i % 25 == 0 {
                tree.flush().await.unwrap();
            }
        }
        tree.flush().await.unwrap();
        drop(tree);

        let mut tree = BlockTree::open(&path, Mode::Read, TreeOptions::default())
            .await
            .unwrap();
        tree.check(true).await.unwrap();
        for i in 0..100 {
            assert!(tree.lookup(&format!("obj-{i:03}")).await.is_ok());
        }
    }
}
