//! File browser for one project: folder tree plus file list.
//!
//! Uploads run in two stages: object storage first, then the database row.
//! A pending placeholder entry is visible from the first moment; if the
//! storage upload fails the database insert is skipped entirely, so no
//! orphaned record can exist. File tables are low-frequency, so realtime
//! events reload the listing rather than merging.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, SyncError};
use crate::gateway::{FolderScope, SubscriptionFilter, Table};
use crate::optimistic::{
    create_entry, perform_optimistic, shared_revision, upsert_by_id, Collection, MutationQueue,
    ViewLease,
};
use crate::reconciler::{decide, spawn_pump, MergePolicy, ReconcileAction};
use crate::types::{
    FilePatch, FileRecord, Folder, Keyed, NewFileRecord, NewFolder, RecordId,
};

use super::ViewContext;

/// Signed download links expire after an hour, matching what the UI shows.
const DOWNLOAD_URL_TTL_SECS: u64 = 3_600;

pub struct FileBrowser {
    ctx: ViewContext,
    project_id: String,
    lease: ViewLease,
    revision: Arc<tokio::sync::watch::Sender<u64>>,
    folders: Collection<Folder>,
    files: Collection<FileRecord>,
    queue: MutationQueue,
    pumps: Vec<JoinHandle<()>>,
}

impl FileBrowser {
    pub fn new(ctx: ViewContext, project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let lease = ViewLease::new();
        let revision = shared_revision();
        let folders = Collection::with_revision(lease.clone(), Arc::clone(&revision));
        let files = Collection::with_revision(lease.clone(), Arc::clone(&revision));

        let mut browser = Self {
            ctx,
            project_id,
            lease,
            revision,
            folders,
            files,
            queue: MutationQueue::new(),
            pumps: Vec::new(),
        };
        browser.spawn_reconcilers();
        browser
    }

    pub async fn load(&self) -> Result<(), SyncError> {
        load_listing(
            &self.ctx,
            &self.project_id,
            &self.folders,
            &self.files,
        )
        .await
    }

    pub fn folders(&self) -> Vec<Folder> {
        self.folders.snapshot()
    }

    pub fn files(&self) -> Vec<FileRecord> {
        self.files.snapshot()
    }

    /// Files inside one folder (or at the root), active only.
    pub fn files_in(&self, folder_id: Option<&str>) -> Vec<FileRecord> {
        self.files
            .snapshot()
            .into_iter()
            .filter(|f| f.folder_id.as_deref() == folder_id)
            .collect()
    }

    pub fn revision(&self) -> tokio::sync::watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Upload bytes and register the file record. A pending placeholder
    /// appears immediately; it is swapped for the confirmed record, or
    /// removed on failure at either stage.
    pub async fn upload(
        &self,
        name: &str,
        bytes: Vec<u8>,
        mime_type: Option<String>,
        folder_id: Option<String>,
        card_id: Option<String>,
    ) -> Result<FileRecord, SyncError> {
        let size_bytes = bytes.len() as u64;
        let path = storage_path(&self.project_id, folder_id.as_deref(), name);

        let placeholder = FileRecord {
            id: RecordId::tentative(),
            project_id: self.project_id.clone(),
            name: name.to_string(),
            storage_path: String::new(),
            mime_type: mime_type.clone(),
            size_bytes,
            folder_id: folder_id.clone(),
            card_id: card_id.clone(),
            message_id: None,
            uploaded_by: Some(self.ctx.session.user_id.clone()),
            created_at: Utc::now(),
            deleted_at: None,
        };
        let token = placeholder.id.clone();
        self.files.mutate({
            let placeholder = placeholder.clone();
            move |entries| entries.push(placeholder)
        });

        // Stage 1: object storage. On failure the database insert is
        // skipped entirely.
        let stored_path = match self.ctx.files.upload(&path, bytes).await {
            Ok(path) => path,
            Err(err) => {
                let err = SyncError::Upload(err.to_string());
                if self.lease.is_active() {
                    self.files
                        .mutate(|entries| entries.retain(|f| f.id != token));
                    self.ctx.notices.sync_failure("Upload file", &err);
                }
                return Err(err);
            }
        };

        // Stage 2: the file row, reconciled like any other create.
        let new = NewFileRecord {
            project_id: self.project_id.clone(),
            name: name.to_string(),
            storage_path: stored_path.clone(),
            mime_type,
            size_bytes,
            folder_id,
            card_id,
            message_id: None,
            uploaded_by: Some(self.ctx.session.user_id.clone()),
        };
        let confirm_token = token.clone();
        let rollback_token = token.clone();
        let result = perform_optimistic(
            &self.ctx.mutation_cx("Upload file"),
            &self.files,
            |_| {},
            self.ctx.gateway.insert_file(new),
            move |entries, confirmed: &FileRecord| {
                match entries.iter_mut().find(|f| f.id == confirm_token) {
                    Some(slot) => *slot = confirmed.clone(),
                    None => upsert_by_id(entries, confirmed.clone()),
                }
            },
            move |entries| entries.retain(|f| f.id != rollback_token),
            None,
        )
        .await;

        match result {
            Ok(record) => {
                if let Some(id) = record.persisted_id() {
                    self.ctx.ledger.record(id);
                }
                Ok(record)
            }
            Err(err) => {
                // The object landed but its record did not; drop it so the
                // bucket does not accumulate unreferenced blobs.
                if let Err(cleanup) = self.ctx.files.remove(&[stored_path]).await {
                    log::debug!("upload cleanup failed: {cleanup}");
                }
                Err(err)
            }
        }
    }

    /// Short-lived download link for a confirmed file.
    pub async fn download_url(&self, file_id: &str) -> Result<String, SyncError> {
        let file = self.files.find_persisted(file_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("file {file_id}")))
        })?;
        let url = self
            .ctx
            .files
            .create_signed_url(&file.storage_path, DOWNLOAD_URL_TTL_SECS, true)
            .await?;
        Ok(url)
    }

    pub async fn create_folder(
        &self,
        name: impl Into<String>,
        parent_id: Option<String>,
    ) -> Result<Folder, SyncError> {
        let name = name.into();
        let tentative = Folder {
            id: RecordId::tentative(),
            project_id: self.project_id.clone(),
            name: name.clone(),
            parent_id: parent_id.clone(),
        };
        let new = NewFolder {
            project_id: self.project_id.clone(),
            name,
            parent_id,
        };
        create_entry(
            &self.ctx.mutation_cx("Create folder"),
            &self.folders,
            tentative,
            self.ctx.gateway.insert_folder(new),
        )
        .await
    }

    /// Move a file to another folder: relocate the stored object, then
    /// patch the record. Remote-first; failures reload the listing.
    pub async fn move_file(
        &self,
        file_id: &str,
        target_folder_id: Option<String>,
    ) -> Result<FileRecord, SyncError> {
        let _turn = self.queue.acquire(file_id).await;

        let file = self.files.find_persisted(file_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("file {file_id}")))
        })?;
        let new_path = storage_path(&self.project_id, target_folder_id.as_deref(), &file.name);

        if let Err(err) = self
            .ctx
            .files
            .relocate(&file.storage_path, &new_path)
            .await
        {
            let err = SyncError::Remote(err);
            self.ctx.notices.sync_failure("Move file", &err);
            return Err(err);
        }

        let patch = FilePatch {
            storage_path: Some(new_path),
            folder_id: Some(target_folder_id),
            ..FilePatch::default()
        };
        match self.ctx.gateway.update_file(file_id, patch).await {
            Ok(record) => {
                if self.lease.is_active() {
                    self.files.upsert(record.clone());
                    self.ctx.ledger.record(file_id);
                }
                Ok(record)
            }
            Err(err) => {
                let err = SyncError::Remote(err);
                self.ctx.notices.sync_failure("Move file", &err);
                if let Err(reload) =
                    load_listing(&self.ctx, &self.project_id, &self.folders, &self.files).await
                {
                    log::warn!("files: reload after failed move failed: {reload}");
                }
                Err(err)
            }
        }
    }

    /// Soft-delete: the entry leaves the listing and lands in the trash.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), SyncError> {
        let _turn = self.queue.acquire(file_id).await;

        let previous = self.files.find_persisted(file_id).ok_or_else(|| {
            SyncError::Remote(GatewayError::NotFound(format!("file {file_id}")))
        })?;

        perform_optimistic(
            &self.ctx.mutation_cx("Delete file"),
            &self.files,
            |entries| entries.retain(|f| f.persisted_id() != Some(file_id)),
            self.ctx.gateway.update_file(
                file_id,
                FilePatch {
                    deleted_at: Some(Some(Utc::now())),
                    ..FilePatch::default()
                },
            ),
            |_, _confirmed: &FileRecord| {},
            |entries| entries.push(previous),
            Some(file_id),
        )
        .await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.lease.revoke();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn spawn_reconcilers(&mut self) {
        for table in [Table::Files, Table::Folders] {
            let stream = self
                .ctx
                .gateway
                .subscribe(table, SubscriptionFilter::Project(self.project_id.clone()));
            let ctx = self.ctx.clone();
            let project_id = self.project_id.clone();
            let folders = self.folders.clone();
            let files = self.files.clone();
            let pump = spawn_pump(stream, self.lease.clone(), move |event| {
                let ctx = ctx.clone();
                let project_id = project_id.clone();
                let folders = folders.clone();
                let files = files.clone();
                async move {
                    match decide(&ctx.ledger, &ctx.session, &event, MergePolicy::Reload, false) {
                        ReconcileAction::Suppress => {}
                        ReconcileAction::Reload | ReconcileAction::Merge => {
                            if let Err(err) =
                                load_listing(&ctx, &project_id, &folders, &files).await
                            {
                                log::warn!("files: realtime reload failed: {err}");
                            }
                        }
                    }
                }
            });
            self.pumps.push(pump);
        }
    }
}

impl Drop for FileBrowser {
    fn drop(&mut self) {
        self.close();
    }
}

fn storage_path(project_id: &str, folder_id: Option<&str>, name: &str) -> String {
    match folder_id {
        Some(folder) => format!("{project_id}/folder-{folder}/{name}"),
        None => format!("{project_id}/{name}"),
    }
}

async fn load_listing(
    ctx: &ViewContext,
    project_id: &str,
    folders: &Collection<Folder>,
    files: &Collection<FileRecord>,
) -> Result<(), SyncError> {
    let loaded_folders = ctx.gateway.list_folders(project_id).await?;
    let loaded_files = ctx
        .gateway
        .list_files(project_id, FolderScope::Any)
        .await?;
    if !files.lease().is_active() {
        return Err(SyncError::StaleCollection);
    }
    folders.replace_all(loaded_folders);
    files.replace_all(loaded_files);
    Ok(())
}
