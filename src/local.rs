use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs::{DirEntry, ReadDir};
use tracing::{debug, warn};

use crate::error::EnumerationError;
use crate::tree::{DirCursor, Entry, FileHandle, LeafSource, ResolvedFile, RootSource};

/// Chromium 每次 readEntries 最多返回 100 项，本地目录按同样的页长读取
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// 本地路径作为上传根。每次 `open_roots` 都重新打开目录。
#[derive(Debug, Clone)]
pub struct LocalRoots {
    paths: Vec<PathBuf>,
    page_size: usize,
}

impl LocalRoots {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl RootSource for LocalRoots {
    fn open_roots(&self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>> {
        Box::pin(async move {
            // 每一遍展开各用一份已访问目录集合
            let visited = Visited::default();
            let mut roots = Vec::with_capacity(self.paths.len());
            for path in &self.paths {
                roots.push(open_root(path, self.page_size, &visited).await?);
            }
            Ok(roots)
        })
    }
}

/// 一遍展开中已经进入过的目录（规范化路径），符号链接成环时不会重复进入
type Visited = Arc<Mutex<HashSet<PathBuf>>>;

async fn open_root(path: &Path, page_size: usize, visited: &Visited) -> Result<Entry, EnumerationError> {
    let io_error = |source| EnumerationError::Io {
        path: path.to_path_buf(),
        source,
    };

    // 规范化后才能拿到 `.`、`..` 这类输入的真实目录名
    let canonical = tokio::fs::canonicalize(path).await.map_err(io_error)?;
    let canonical = dunce::simplified(&canonical).to_path_buf();
    let name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let metadata = tokio::fs::metadata(&canonical).await.map_err(io_error)?;

    if metadata.is_dir() {
        visited.lock().insert(canonical.clone());
        Ok(Entry::dir(name, LocalDirCursor::within(canonical, page_size, Arc::clone(visited))))
    } else {
        let file = resolved(canonical, &metadata);
        Ok(Entry::file(name, file))
    }
}

fn resolved(path: PathBuf, metadata: &Metadata) -> ResolvedFile {
    ResolvedFile {
        size: metadata.len(),
        source: LeafSource::Path(path),
        last_modified: metadata.modified().ok().map(OffsetDateTime::from),
    }
}

enum CursorState {
    Unopened,
    Open(ReadDir),
    Done,
}

/// 本地目录的分页游标
pub struct LocalDirCursor {
    path: PathBuf,
    page_size: usize,
    state: CursorState,
    visited: Visited,
}

impl LocalDirCursor {
    pub fn new(path: PathBuf, page_size: usize) -> Self {
        Self::within(path, page_size, Visited::default())
    }

    fn within(path: PathBuf, page_size: usize, visited: Visited) -> Self {
        Self {
            path,
            page_size: page_size.max(1),
            state: CursorState::Unopened,
            visited,
        }
    }

    async fn read_page(&mut self) -> Result<Vec<Entry>, EnumerationError> {
        if let CursorState::Unopened = self.state {
            let read_dir = tokio::fs::read_dir(&self.path)
                .await
                .map_err(|source| EnumerationError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            self.state = CursorState::Open(read_dir);
        }

        let CursorState::Open(read_dir) = &mut self.state else {
            return Ok(Vec::new());
        };

        let mut page = Vec::new();
        let mut exhausted = false;
        while page.len() < self.page_size {
            let next = read_dir.next_entry().await.map_err(|source| EnumerationError::Io {
                path: self.path.clone(),
                source,
            })?;
            match next {
                Some(entry) => {
                    if let Some(child) = child_entry(entry, self.page_size, &self.visited).await {
                        page.push(child);
                    }
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            self.state = CursorState::Done;
        }
        debug!(dir = %self.path.display(), entries = page.len(), "local directory page");
        Ok(page)
    }
}

impl DirCursor for LocalDirCursor {
    fn next_page(&mut self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>> {
        Box::pin(self.read_page())
    }
}

/// 已经进入过的目录返回 `None`
async fn child_entry(entry: DirEntry, page_size: usize, visited: &Visited) -> Option<Entry> {
    let path = entry.path();
    let name = entry.file_name().to_string_lossy().into_owned();

    // 符号链接按目标类型处理
    let is_dir = match entry.file_type().await {
        Ok(kind) if kind.is_symlink() => tokio::fs::metadata(&path).await.map(|m| m.is_dir()),
        Ok(kind) => Ok(kind.is_dir()),
        Err(err) => Err(err),
    };

    let entry = match is_dir {
        Ok(true) => {
            let canonical = match tokio::fs::canonicalize(&path).await {
                Ok(canonical) => canonical,
                Err(source) => {
                    return Some(Entry::File(FileHandle::deferred(name, async move {
                        Err(EnumerationError::Io { path, source })
                    })))
                }
            };
            if !visited.lock().insert(dunce::simplified(&canonical).to_path_buf()) {
                warn!(dir = %path.display(), "directory already visited, skipping");
                return None;
            }
            Entry::dir(name, LocalDirCursor::within(path, page_size, Arc::clone(visited)))
        }
        Ok(false) => Entry::File(FileHandle::deferred(name, async move {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|source| EnumerationError::Io {
                    path: path.clone(),
                    source,
                })?;
            Ok(resolved(path, &metadata))
        })),
        // 读不到类型的条目留到展开时再报错，不影响同一页的其他条目
        Err(source) => Entry::File(FileHandle::deferred(name, async move {
            Err(EnumerationError::Io { path, source })
        })),
    };
    Some(entry)
}
