//! Push engine: bulk writes with client-allocated revisions.

use serde_json::{json, Value};
use tracing::debug;

use couchsync_common::{Error, RemoteObject};

use crate::codec;
use crate::revision::next_revision;
use crate::store::RemoteStore;
use crate::task::{cancellable, Task};
use crate::transport::Method;

impl RemoteStore {
    /// Write `objects` in one `_bulk_docs` request with `new_edits=false`.
    ///
    /// Each object receives the next revision of its chain; objects without
    /// an id get a fresh one. The task resolves with the objects as written.
    /// Transport errors are returned unchanged.
    pub fn push(&self, objects: &[RemoteObject]) -> Task<Vec<RemoteObject>> {
        if objects.is_empty() {
            return Task::ready(Vec::new());
        }

        let prefix = self.prefix();
        let written: Vec<RemoteObject> = objects.iter().map(|o| self.next_version(o)).collect();
        let docs: Vec<Value> = written
            .iter()
            .map(|object| Value::Object(codec::to_document(object, prefix)))
            .collect();
        let body = json!({ "docs": docs, "new_edits": false });
        let path = self.path("/_bulk_docs");

        let (push_id, token) = self.inner.state().begin_push();
        debug!(store = %self.name(), count = written.len(), "Pushing documents");

        let store = self.clone();
        let request_token = token.clone();
        Task::spawn(token, async move {
            let result = cancellable(&request_token, store.send(Method::Post, &path, Some(body))).await;
            store.inner.state().finish_push(push_id);
            result.map(|_| written)
        })
    }

    /// Write a single object with `PUT`, letting the server allocate the
    /// revision. Resolves with the object carrying the returned `rev`.
    pub fn save(&self, object: RemoteObject) -> Task<RemoteObject> {
        let mut object = object;
        if !object.has_id() {
            object.id = self.inner.ids.generate();
        }
        let doc = codec::to_document(&object, self.prefix());
        let path = self.document_path(&object.object_type, &object.id);

        let (push_id, token) = self.inner.state().begin_push();
        debug!(store = %self.name(), object_type = %object.object_type, id = %object.id, "Saving document");

        let store = self.clone();
        let request_token = token.clone();
        Task::spawn(token, async move {
            let result =
                cancellable(&request_token, store.send(Method::Put, &path, Some(Value::Object(doc))))
                    .await;
            store.inner.state().finish_push(push_id);

            let response = result?;
            let rev = response
                .get("rev")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Serialization("Missing rev in save response".into()))?;
            object.rev = Some(rev.to_string());
            Ok(object)
        })
    }

    fn next_version(&self, object: &RemoteObject) -> RemoteObject {
        let mut next = object.clone();
        if !next.has_id() {
            next.id = self.inner.ids.generate();
        }
        let revision = next_revision(
            object.rev.as_deref(),
            object.revisions.as_ref(),
            object.local_only,
            &self.inner.ids.generate(),
        );
        next.rev = Some(revision.rev);
        next.revisions = Some(revision.revisions);
        next
    }
}
