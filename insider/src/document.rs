//! Shared text document backed by a yrs CRDT.
//!
//! One [`Document`] exists per active file path (plus one for the notes
//! pane). Local mutations (`insert`/`delete`/`replace`) accumulate inside
//! the underlying doc until [`Document::flush_pending_patch`] encodes them
//! as a self-contained binary [`Patch`]; remote replicas converge by
//! feeding those patches to [`Document::apply_patch`] in any causal order.
//!
//! Indices are UTF-16 offsets into the current view and clamp to the end
//! of the text, so a `delete(0, u32::MAX)` means "delete everything".

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact};

/// An immutable binary-encoded document mutation.
///
/// `logical_time` is the canonical replica's clock after the patch was
/// applied there; patches produced by externally-triggered rewrites (file
/// watcher, active-path switch) carry no time and live in the history's
/// untimed bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub bytes: Vec<u8>,
    pub logical_time: Option<u64>,
}

impl Patch {
    pub fn timed(bytes: Vec<u8>, logical_time: u64) -> Self {
        Self {
            bytes,
            logical_time: Some(logical_time),
        }
    }

    pub fn untimed(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            logical_time: None,
        }
    }
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// The patch bytes could not be decoded as a CRDT update.
    MalformedPatch(String),
    /// A decoded update failed to integrate.
    ApplyFailed(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPatch(e) => write!(f, "malformed patch: {e}"),
            Self::ApplyFailed(e) => write!(f, "patch apply failed: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// A CRDT text container with a patch-oriented mutation surface.
pub struct Document {
    doc: Doc,
    text: TextRef,
    /// State vector at the last flush; the next pending patch is the diff
    /// from this point.
    flushed: StateVector,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        let mut options = Options::default();
        options.offset_kind = OffsetKind::Utf16;
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text("content");
        let flushed = doc.transact().state_vector();
        Self { doc, text, flushed }
    }

    /// Create a document seeded with `initial` as one pending-free mutation.
    pub fn seeded(initial: &str) -> Self {
        let mut document = Self::new();
        document.seed(initial);
        document
    }

    /// Replace the whole content and swallow the resulting pending patch.
    ///
    /// Used when the document is (re)created from an underlying file; the
    /// seed is part of the initial state, not an edit to broadcast.
    pub fn seed(&mut self, initial: &str) {
        self.replace(initial);
        let _ = self.flush_pending_patch();
    }

    /// Insert `chunk` at `index` (UTF-16 offset, clamped to end-of-text).
    pub fn insert(&mut self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        self.text.insert(&mut txn, index.min(len), chunk);
    }

    /// Delete `length` units starting at `index`, both clamped to the text.
    pub fn delete(&mut self, index: u32, length: u32) {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        let start = index.min(len);
        let count = length.min(len - start);
        if count > 0 {
            self.text.remove_range(&mut txn, start, count);
        }
    }

    /// Delete everything and insert `text` as a single pending mutation.
    pub fn replace(&mut self, text: &str) {
        self.delete(0, u32::MAX);
        self.insert(0, text);
    }

    /// Encode all mutations since the previous flush as one [`Patch`].
    ///
    /// The patch is stamped with the post-mutation logical time. Returns
    /// `None` when there is nothing pending.
    pub fn flush_pending_patch(&mut self) -> Option<Patch> {
        let txn = self.doc.transact();
        let current = txn.state_vector();
        if current == self.flushed {
            return None;
        }
        let bytes = txn.encode_diff_v1(&self.flushed);
        drop(txn);
        self.flushed = current;
        Some(Patch::timed(bytes, self.logical_time()))
    }

    /// Apply a patch produced by some replica of this document.
    ///
    /// Succeeds regardless of concurrent local edits: addressing is by
    /// stable CRDT identifiers, so out-of-position patches converge via
    /// the CRDT's tie-break instead of erroring. Re-applying an already
    /// seen patch is a no-op.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<(), DocumentError> {
        let update = yrs::Update::decode_v1(&patch.bytes)
            .map_err(|e| DocumentError::MalformedPatch(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        drop(txn);
        // Remote patches are already shared state, not pending local edits.
        self.flushed = self.doc.transact().state_vector();
        Ok(())
    }

    /// Current text view.
    pub fn view(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the current view in UTF-16 units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical clock: total number of CRDT operations integrated so far.
    /// Monotonically non-decreasing under both local edits and applies.
    pub fn logical_time(&self) -> u64 {
        let txn = self.doc.transact();
        txn.state_vector()
            .iter()
            .map(|(_, clock)| *clock as u64)
            .sum()
    }

    /// Full-state snapshot for document rewrites.
    pub fn serialize(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Rebuild a document from a [`Document::serialize`] snapshot.
    pub fn deserialize(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new();
        document.apply_patch(&Patch::untimed(snapshot.to_vec()))?;
        Ok(document)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_view() {
        let mut doc = Document::new();
        doc.insert(0, "hello");
        doc.insert(5, " world");
        assert_eq!(doc.view(), "hello world");
    }

    #[test]
    fn test_insert_clamps_to_end() {
        let mut doc = Document::new();
        doc.insert(0, "abc");
        doc.insert(999, "!");
        assert_eq!(doc.view(), "abc!");
    }

    #[test]
    fn test_delete_to_end() {
        let mut doc = Document::new();
        doc.insert(0, "hello world");
        doc.delete(5, u32::MAX);
        assert_eq!(doc.view(), "hello");
    }

    #[test]
    fn test_delete_out_of_range_is_noop() {
        let mut doc = Document::new();
        doc.insert(0, "abc");
        doc.delete(10, 5);
        assert_eq!(doc.view(), "abc");
    }

    #[test]
    fn test_replace() {
        let mut doc = Document::new();
        doc.insert(0, "old content");
        doc.replace("new");
        assert_eq!(doc.view(), "new");
    }

    #[test]
    fn test_flush_empty_returns_none() {
        let mut doc = Document::new();
        assert!(doc.flush_pending_patch().is_none());
        doc.insert(0, "x");
        assert!(doc.flush_pending_patch().is_some());
        assert!(doc.flush_pending_patch().is_none());
    }

    #[test]
    fn test_patch_transfers_edit() {
        let mut a = Document::new();
        let mut b = Document::new();

        a.insert(0, "shared");
        let patch = a.flush_pending_patch().unwrap();
        b.apply_patch(&patch).unwrap();

        assert_eq!(b.view(), "shared");
        assert_eq!(a.view(), b.view());
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        // Both replicas seeded empty; concurrent inserts at index 0.
        let mut a = Document::new();
        let mut b = Document::new();

        a.insert(0, "foo");
        b.insert(0, "bar");
        let pa = a.flush_pending_patch().unwrap();
        let pb = b.flush_pending_patch().unwrap();

        a.apply_patch(&pb).unwrap();
        b.apply_patch(&pa).unwrap();

        // Tie-break order is the CRDT's business; convergence is ours.
        assert_eq!(a.view(), b.view());
        assert!(a.view() == "foobar" || a.view() == "barfoo");
    }

    #[test]
    fn test_apply_order_independent() {
        let mut source = Document::new();
        source.insert(0, "one");
        let p1 = source.flush_pending_patch().unwrap();
        source.insert(3, " two");
        let p2 = source.flush_pending_patch().unwrap();

        let mut forward = Document::new();
        forward.apply_patch(&p1).unwrap();
        forward.apply_patch(&p2).unwrap();

        let mut reversed = Document::new();
        reversed.apply_patch(&p2).unwrap();
        reversed.apply_patch(&p1).unwrap();

        assert_eq!(forward.view(), "one two");
        assert_eq!(forward.view(), reversed.view());
    }

    #[test]
    fn test_idempotent_redelivery() {
        let mut source = Document::new();
        source.insert(0, "once");
        let patch = source.flush_pending_patch().unwrap();

        let mut replica = Document::new();
        replica.apply_patch(&patch).unwrap();
        let before = replica.view();
        replica.apply_patch(&patch).unwrap();
        assert_eq!(replica.view(), before);
    }

    #[test]
    fn test_malformed_patch_rejected() {
        let mut doc = Document::new();
        doc.insert(0, "keep");
        let garbage = Patch::untimed(vec![0xFF, 0xFE, 0xFD, 0xFC]);
        assert!(matches!(
            doc.apply_patch(&garbage),
            Err(DocumentError::MalformedPatch(_))
        ));
        assert_eq!(doc.view(), "keep");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut doc = Document::new();
        doc.insert(0, "snapshot me");
        doc.delete(0, 4);

        let restored = Document::deserialize(&doc.serialize()).unwrap();
        assert_eq!(restored.view(), doc.view());
    }

    #[test]
    fn test_seed_leaves_nothing_pending() {
        let mut doc = Document::new();
        doc.seed("from disk");
        assert_eq!(doc.view(), "from disk");
        assert!(doc.flush_pending_patch().is_none());
    }

    #[test]
    fn test_logical_time_monotonic() {
        let mut doc = Document::new();
        let t0 = doc.logical_time();
        doc.insert(0, "a");
        let t1 = doc.logical_time();
        doc.insert(1, "b");
        let t2 = doc.logical_time();
        assert!(t0 <= t1 && t1 <= t2);
        assert!(t2 > t0);
    }

    #[test]
    fn test_utf16_offsets() {
        let mut doc = Document::new();
        doc.insert(0, "héllo");
        // 'é' is one UTF-16 unit; deleting 2 units removes "hé".
        doc.delete(0, 2);
        assert_eq!(doc.view(), "llo");
    }
}
