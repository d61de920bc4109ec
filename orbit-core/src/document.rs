//! Replicated document capability.
//!
//! The merge algorithm is an external collaborator: anything that offers
//! named sub-structures, a delta stream, and full-state encode/apply can
//! back a store. [`YrsDocument`] provides it on top of `yrs`.
//!
//! ```text
//!  consumer writes ──► ┌──────────────┐ ──► on_change(delta, origin)
//!                      │ YrsDocument  │
//!  apply_delta(.., o) ►│  (yrs::Doc)  │ ──► encode_full_state()
//!                      └──────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use yrs::updates::decoder::Decode;
use yrs::{
    ArrayRef, Doc, GetString, MapRef, OffsetKind, Options, ReadTxn, StateVector, Subscription,
    Text, TextRef, Transact, TransactionMut, Update,
};

use crate::error::DocumentError;
use crate::origin::Origin;
use crate::text_diff::{self, TextEdit};

/// Capability interface of a mergeable document.
///
/// Implementations must make `apply_delta` idempotent and order-independent.
pub trait ReplicatedDocument: Send + Sync + 'static {
    /// Handle to a named key/value structure.
    type Map: Clone;
    /// Handle to a named collaborative text.
    type Text: Clone;
    /// Handle to a named ordered sequence.
    type Sequence: Clone;
    /// Keeps a change handler registered until dropped.
    type Subscription: Send + Sync + 'static;

    fn map(&self, name: &str) -> Self::Map;
    fn text(&self, name: &str) -> Self::Text;
    fn sequence(&self, name: &str) -> Self::Sequence;

    /// Register a handler for every committed change.
    ///
    /// The handler receives the incremental delta and the origin of the
    /// transaction that produced it. It runs while the transaction is being
    /// committed and must not start another transaction on the same document.
    fn on_change<F>(&self, handler: F) -> Result<Self::Subscription, DocumentError>
    where
        F: Fn(&[u8], &Origin) + Send + Sync + 'static;

    /// Encode the complete current state as a single delta.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Merge a delta produced by any replica.
    fn apply_delta(&self, delta: &[u8], origin: Origin) -> Result<(), DocumentError>;

    /// Replace the content of a named text with `new_text` using the
    /// minimal edit, in one transaction.
    fn replace_text(
        &self,
        name: &str,
        new_text: &str,
        origin: Origin,
    ) -> Result<Option<TextEdit>, DocumentError>;

    /// Release the document. Later `apply_delta` calls are rejected.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// `yrs`-backed replicated document.
///
/// Text offsets are configured as UTF-8 byte offsets; [`TextEdit`] char
/// positions are converted before they reach `yrs`.
pub struct YrsDocument {
    doc: Doc,
    destroyed: AtomicBool,
}

impl YrsDocument {
    pub fn new() -> Self {
        let options = Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Borrow the underlying `yrs` document. Raw access skips the
    /// destroyed check; use it for reads.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Start a local write transaction. Fails once the document is destroyed.
    pub fn transact_mut(&self) -> Result<TransactionMut<'_>, DocumentError> {
        self.ensure_alive()?;
        Ok(self.doc.transact_mut_with(yrs::Origin::from(Origin::Local)))
    }

    /// Current content of a named text.
    pub fn text_content(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    fn ensure_alive(&self) -> Result<(), DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        Ok(())
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument for YrsDocument {
    type Map = MapRef;
    type Text = TextRef;
    type Sequence = ArrayRef;
    type Subscription = Subscription;

    fn map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    fn text(&self, name: &str) -> TextRef {
        self.doc.get_or_insert_text(name)
    }

    fn sequence(&self, name: &str) -> ArrayRef {
        self.doc.get_or_insert_array(name)
    }

    fn on_change<F>(&self, handler: F) -> Result<Subscription, DocumentError>
    where
        F: Fn(&[u8], &Origin) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = Origin::from_yrs(txn.origin());
                handler(event.update.as_slice(), &origin);
            })
            .map_err(|e| DocumentError::Subscribe(format!("{e:?}")))
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_delta(&self, delta: &[u8], origin: Origin) -> Result<(), DocumentError> {
        self.ensure_alive()?;
        let update = Update::decode_v1(delta)?;
        let mut txn = self.doc.transact_mut_with(yrs::Origin::from(origin));
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    fn replace_text(
        &self,
        name: &str,
        new_text: &str,
        origin: Origin,
    ) -> Result<Option<TextEdit>, DocumentError> {
        self.ensure_alive()?;
        // Resolve the root before opening the write transaction.
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut_with(yrs::Origin::from(origin));
        let current = text.get_string(&txn);

        let Some(edit) = text_diff::diff(&current, new_text) else {
            return Ok(None);
        };

        let range = edit.byte_range(&current);
        let start = u32::try_from(range.start).map_err(|_| DocumentError::TooLarge(range.start))?;
        if edit.has_delete() {
            let len = u32::try_from(range.len()).map_err(|_| DocumentError::TooLarge(range.len()))?;
            text.remove_range(&mut txn, start, len);
        }
        if edit.has_insert() {
            text.insert(&mut txn, start, &edit.insert);
        }
        log::trace!(
            "replace_text {name}: index={} remove={} insert={}",
            edit.index,
            edit.remove,
            edit.insert.len()
        );
        Ok(Some(edit))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use yrs::{Array, Map};

    fn text_of(doc: &YrsDocument, name: &str) -> String {
        doc.text_content(name)
    }

    #[test]
    fn test_named_structures_share_state() {
        let doc = YrsDocument::new();
        let a = doc.map("settings");
        let b = doc.map("settings");
        {
            let mut txn = doc.transact_mut().unwrap();
            a.insert(&mut txn, "theme", "dark");
        }
        let txn = doc.doc().transact();
        assert_eq!(b.get(&txn, "theme").map(|v| v.to_string(&txn)), Some("dark".to_string()));
    }

    #[test]
    fn test_apply_delta_converges() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        {
            let text = a.text("body");
            let mut txn = a.transact_mut().unwrap();
            text.insert(&mut txn, 0, "hello");
        }
        b.apply_delta(&a.encode_full_state(), Origin::Network).unwrap();
        assert_eq!(text_of(&b, "body"), "hello");
    }

    #[test]
    fn test_apply_delta_idempotent() {
        let a = YrsDocument::new();
        let b = YrsDocument::new();
        {
            let list = a.sequence("items");
            let mut txn = a.transact_mut().unwrap();
            list.push_back(&mut txn, "one");
            list.push_back(&mut txn, "two");
        }
        let state = a.encode_full_state();
        b.apply_delta(&state, Origin::Network).unwrap();
        let once = b.encode_full_state();
        b.apply_delta(&state, Origin::Network).unwrap();
        assert_eq!(b.encode_full_state(), once);

        let items = b.sequence("items");
        let txn = b.doc().transact();
        assert_eq!(items.len(&txn), 2);
    }

    #[test]
    fn test_on_change_reports_origin() {
        let doc = YrsDocument::new();
        let seen: Arc<Mutex<Vec<Origin>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc
            .on_change(move |_delta, origin| sink.lock().unwrap().push(*origin))
            .unwrap();

        {
            let text = doc.text("body");
            let mut txn = doc.transact_mut().unwrap();
            text.insert(&mut txn, 0, "x");
        }

        let remote = YrsDocument::new();
        {
            let text = remote.text("body");
            let mut txn = remote.transact_mut().unwrap();
            text.insert(&mut txn, 0, "y");
        }
        doc.apply_delta(&remote.encode_full_state(), Origin::Network).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Origin::Local, Origin::Network]);
    }

    #[test]
    fn test_subscription_drop_stops_notifications() {
        let doc = YrsDocument::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let sub = doc.on_change(move |_, _| *sink.lock().unwrap() += 1).unwrap();

        doc.replace_text("t", "a", Origin::Local).unwrap();
        drop(sub);
        doc.replace_text("t", "ab", Origin::Local).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_replace_text_minimal_edit() {
        let doc = YrsDocument::new();
        doc.replace_text("body", "Hello World", Origin::Local).unwrap();
        let edit = doc
            .replace_text("body", "Hello Orbit World", Origin::Local)
            .unwrap()
            .unwrap();
        assert_eq!(edit.index, 5);
        assert_eq!(edit.remove, 0);
        assert_eq!(text_of(&doc, "body"), "Hello Orbit World");

        assert!(doc.replace_text("body", "Hello Orbit World", Origin::Local).unwrap().is_none());
    }

    #[test]
    fn test_replace_text_multibyte() {
        let doc = YrsDocument::new();
        doc.replace_text("body", "naïve café", Origin::Local).unwrap();
        doc.replace_text("body", "naïve crème café", Origin::Local).unwrap();
        assert_eq!(text_of(&doc, "body"), "naïve crème café");
        doc.replace_text("body", "", Origin::Local).unwrap();
        assert_eq!(text_of(&doc, "body"), "");
    }

    #[test]
    fn test_destroyed_rejects_deltas() {
        let doc = YrsDocument::new();
        let other = YrsDocument::new();
        other.replace_text("t", "data", Origin::Local).unwrap();

        doc.destroy();
        assert!(doc.is_destroyed());
        assert!(matches!(
            doc.apply_delta(&other.encode_full_state(), Origin::Network),
            Err(DocumentError::Destroyed)
        ));
        assert!(matches!(
            doc.replace_text("t", "x", Origin::Local),
            Err(DocumentError::Destroyed)
        ));
        assert!(matches!(doc.transact_mut(), Err(DocumentError::Destroyed)));
    }

    #[test]
    fn test_garbage_delta_is_error() {
        let doc = YrsDocument::new();
        assert!(doc.apply_delta(&[0xFF, 0xFE, 0xFD], Origin::Network).is_err());
    }
}
