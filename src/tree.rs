//! 上传根的展开：把文件与嵌套目录句柄展开成叶子文件序列。
//!
//! 目录句柄的游标只能遍历一次。需要计数和上传两遍时，每一遍都要通过
//! [`RootSource::open_roots`] 重新拿到一组句柄。

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::EnumerationError;

/// 叶子文件内容的来源
#[derive(Debug, Clone)]
pub enum LeafSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// 已解析出长度和来源的文件
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub size: u64,
    pub source: LeafSource,
    pub last_modified: Option<OffsetDateTime>,
}

impl ResolvedFile {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            source: LeafSource::Memory(data),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, last_modified: OffsetDateTime) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// 有的句柄能同步给出文件，有的只能异步回调
pub enum FileAccess {
    Immediate(ResolvedFile),
    Deferred(BoxFuture<'static, Result<ResolvedFile, EnumerationError>>),
}

pub struct FileHandle {
    name: String,
    access: FileAccess,
}

impl FileHandle {
    pub fn ready(name: impl Into<String>, file: ResolvedFile) -> Self {
        Self {
            name: name.into(),
            access: FileAccess::Immediate(file),
        }
    }

    pub fn deferred<F>(name: impl Into<String>, resolve: F) -> Self
    where
        F: Future<Output = Result<ResolvedFile, EnumerationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            access: FileAccess::Deferred(Box::pin(resolve)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(self) -> Result<ResolvedFile, EnumerationError> {
        match self.access {
            FileAccess::Immediate(file) => Ok(file),
            FileAccess::Deferred(pending) => pending.await,
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            FileAccess::Immediate(_) => "immediate",
            FileAccess::Deferred(_) => "deferred",
        };
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("access", &access)
            .finish()
    }
}

/// 目录的分页游标。
///
/// 每次调用返回下一页子项，空页表示已经读完；非空页之后可能还有更多页。
pub trait DirCursor: Send {
    fn next_page(&mut self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>>;
}

pub struct DirHandle {
    name: String,
    cursor: Box<dyn DirCursor>,
}

impl DirHandle {
    pub fn new(name: impl Into<String>, cursor: impl DirCursor + 'static) -> Self {
        Self {
            name: name.into(),
            cursor: Box::new(cursor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Entry {
    File(FileHandle),
    Dir(DirHandle),
}

impl Entry {
    pub fn file(name: impl Into<String>, file: ResolvedFile) -> Self {
        Entry::File(FileHandle::ready(name, file))
    }

    pub fn dir(name: impl Into<String>, cursor: impl DirCursor + 'static) -> Self {
        Entry::Dir(DirHandle::new(name, cursor))
    }

    pub fn name(&self) -> &str {
        match self {
            Entry::File(file) => file.name(),
            Entry::Dir(dir) => dir.name(),
        }
    }
}

/// 内存里的目录：子项按固定页长分页返回，读完后再读会报错。
pub struct PagedCursor {
    name: String,
    pages: VecDeque<Vec<Entry>>,
    exhausted: bool,
}

impl PagedCursor {
    pub fn new(name: impl Into<String>, mut children: Vec<Entry>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let mut pages = VecDeque::new();
        while !children.is_empty() {
            let rest = children.split_off(page_size.min(children.len()));
            pages.push_back(children);
            children = rest;
        }
        Self {
            name: name.into(),
            pages,
            exhausted: false,
        }
    }
}

impl DirCursor for PagedCursor {
    fn next_page(&mut self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>> {
        Box::pin(async move {
            if self.exhausted {
                return Err(EnumerationError::Exhausted(self.name.clone()));
            }
            match self.pages.pop_front() {
                Some(page) => Ok(page),
                None => {
                    self.exhausted = true;
                    Ok(Vec::new())
                }
            }
        })
    }
}

/// 一个叶子文件：相对上传根的路径（未编码）、长度和内容来源
#[derive(Debug, Clone)]
pub struct LeafDescriptor {
    relative_path: Vec<String>,
    size: u64,
    source: LeafSource,
    last_modified: Option<OffsetDateTime>,
}

impl LeafDescriptor {
    pub fn new(relative_path: Vec<String>, file: ResolvedFile) -> Self {
        Self {
            relative_path,
            size: file.size,
            source: file.source,
            last_modified: file.last_modified,
        }
    }

    pub fn relative_path(&self) -> &[String] {
        &self.relative_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn source(&self) -> &LeafSource {
        &self.source
    }

    pub fn last_modified(&self) -> Option<OffsetDateTime> {
        self.last_modified
    }

    pub fn name(&self) -> &str {
        self.relative_path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn display_path(&self) -> String {
        self.relative_path.join("/")
    }
}

/// 每次调用都产出一组全新的根句柄
pub trait RootSource: Send + Sync {
    fn open_roots(&self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>>;
}

impl<F> RootSource for F
where
    F: Fn() -> BoxFuture<'static, Result<Vec<Entry>, EnumerationError>> + Send + Sync,
{
    fn open_roots(&self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>> {
        (self)()
    }
}

enum Work {
    Entry { prefix: Vec<String>, entry: Entry },
    Dir { path: Vec<String>, cursor: Box<dyn DirCursor> },
}

/// 惰性深度优先展开。
///
/// 只有消费者读完已缓冲的子项后才会请求下一页。单个句柄出错时产出一个 `Err`，
/// 其余句柄继续展开；某一页读取失败则放弃该目录剩下的部分。
pub fn enumerate(roots: Vec<Entry>) -> BoxStream<'static, Result<LeafDescriptor, EnumerationError>> {
    // 逆序入栈，按输入顺序弹出
    let stack: Vec<Work> = roots
        .into_iter()
        .rev()
        .map(|entry| Work::Entry {
            prefix: Vec::new(),
            entry,
        })
        .collect();

    stream::unfold(stack, |mut stack| async move {
        let item = next_leaf(&mut stack).await?;
        Some((item, stack))
    })
    .boxed()
}

async fn next_leaf(stack: &mut Vec<Work>) -> Option<Result<LeafDescriptor, EnumerationError>> {
    while let Some(work) = stack.pop() {
        match work {
            Work::Entry {
                mut prefix,
                entry: Entry::File(file),
            } => {
                push_segment(&mut prefix, &file.name);
                return Some(file.resolve().await.map(|resolved| LeafDescriptor::new(prefix, resolved)));
            }
            Work::Entry {
                mut prefix,
                entry: Entry::Dir(dir),
            } => {
                push_segment(&mut prefix, &dir.name);
                stack.push(Work::Dir {
                    path: prefix,
                    cursor: dir.cursor,
                });
            }
            Work::Dir { path, mut cursor } => {
                let page = cursor.next_page().await;
                match page {
                    Ok(children) if children.is_empty() => {
                        debug!(dir = %path.join("/"), "directory exhausted");
                    }
                    Ok(children) => {
                        debug!(dir = %path.join("/"), children = children.len(), "read directory page");
                        // 目录先放回栈底，这一页的子项处理完再读下一页
                        let pending: Vec<Work> = children
                            .into_iter()
                            .rev()
                            .map(|entry| Work::Entry {
                                prefix: path.clone(),
                                entry,
                            })
                            .collect();
                        stack.push(Work::Dir { path, cursor });
                        stack.extend(pending);
                    }
                    Err(err) => return Some(Err(err)),
                }
            }
        }
    }
    None
}

/// 名称两端的 `/` 去掉，空名不产生路径段
fn push_segment(path: &mut Vec<String>, name: &str) {
    let name = name.trim_matches('/');
    if !name.is_empty() {
        path.push(name.to_string());
    }
}

/// 计数遍的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafCount {
    pub leaves: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// 单独跑一遍展开，只计数不上传
pub async fn count_leaves(roots: Vec<Entry>) -> LeafCount {
    enumerate(roots)
        .fold(LeafCount::default(), |mut count, item| async move {
            match item {
                Ok(leaf) => {
                    count.leaves += 1;
                    count.bytes += leaf.size();
                }
                Err(_) => count.errors += 1,
            }
            count
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn file(name: &str, data: &'static [u8]) -> Entry {
        Entry::file(name, ResolvedFile::from_bytes(data))
    }

    fn dir(name: &str, children: Vec<Entry>) -> Entry {
        Entry::dir(name, PagedCursor::new(name, children, 2))
    }

    async fn collect_paths(roots: Vec<Entry>) -> Vec<String> {
        enumerate(roots)
            .map_ok(|leaf| leaf.display_path())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn flat_file_yields_single_segment() {
        let leaves: Vec<LeafDescriptor> = enumerate(vec![file("a.txt", b"0123456789")])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].relative_path(), ["a.txt"]);
        assert_eq!(leaves[0].size(), 10);
    }

    #[tokio::test]
    async fn nested_container_prefixes_each_level() {
        let roots = vec![dir("photos", vec![dir("2020", vec![file("img.png", b"png")])])];
        let leaves: Vec<LeafDescriptor> = enumerate(roots).try_collect().await.unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].relative_path(), ["photos", "2020", "img.png"]);
    }

    #[tokio::test]
    async fn pages_after_a_full_page_are_still_read() {
        let children = (0..7).map(|i| file(&format!("f{}", i), b"x")).collect();
        let roots = vec![Entry::dir("many", PagedCursor::new("many", children, 3))];
        let paths = collect_paths(roots).await;
        let expected: Vec<String> = (0..7).map(|i| format!("many/f{}", i)).collect();
        assert_eq!(paths, expected);
    }

    #[tokio::test]
    async fn every_leaf_is_visited_exactly_once() {
        let roots = vec![
            dir(
                "a",
                vec![
                    file("1", b"1"),
                    dir("b", vec![file("2", b"2"), file("3", b"3"), dir("empty", vec![])]),
                    dir("c", vec![dir("d", vec![file("4", b"4")]), file("5", b"5")]),
                ],
            ),
            file("6", b"6"),
        ];
        // 游标读完后再读会报错，所以没有 Err 也说明没有目录被重复访问
        let paths = collect_paths(roots).await;
        let unique: HashSet<&String> = paths.iter().collect();
        assert_eq!(paths.len(), 6);
        assert_eq!(unique.len(), 6);
        assert!(paths.contains(&"a/c/d/4".to_string()));
    }

    #[tokio::test]
    async fn slashes_around_names_are_trimmed() {
        let roots = vec![dir("/photos/", vec![file("img.png/", b"")]), dir("/", vec![file("top", b"")])];
        let paths = collect_paths(roots).await;
        assert_eq!(paths, vec!["photos/img.png", "top"]);
    }

    #[tokio::test]
    async fn deferred_and_immediate_files_share_descriptor_shape() {
        let when = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let roots = vec![
            Entry::File(FileHandle::deferred("late.bin", async move {
                Ok(ResolvedFile::from_bytes(&b"later"[..]).with_last_modified(when))
            })),
            file("now.bin", b"now"),
        ];
        let leaves: Vec<LeafDescriptor> = enumerate(roots).try_collect().await.unwrap();
        assert_eq!(leaves[0].relative_path(), ["late.bin"]);
        assert_eq!(leaves[0].size(), 5);
        assert_eq!(leaves[0].last_modified(), Some(when));
        assert_eq!(leaves[1].relative_path(), ["now.bin"]);
        assert_eq!(leaves[1].last_modified(), None);
    }

    #[tokio::test]
    async fn unreadable_file_does_not_stop_siblings() {
        let roots = vec![dir(
            "d",
            vec![
                Entry::File(FileHandle::deferred("broken", async {
                    Err(EnumerationError::Unreadable {
                        name: "broken".into(),
                        reason: "permission denied".into(),
                    })
                })),
                file("ok", b"ok"),
            ],
        )];
        let items: Vec<_> = enumerate(roots).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert_eq!(items[1].as_ref().unwrap().display_path(), "d/ok");
    }

    struct CountingCursor {
        inner: PagedCursor,
        calls: Arc<AtomicUsize>,
    }

    impl DirCursor for CountingCursor {
        fn next_page(&mut self) -> BoxFuture<'_, Result<Vec<Entry>, EnumerationError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.next_page()
        }
    }

    #[tokio::test]
    async fn pages_are_requested_lazily() {
        let calls = Arc::new(AtomicUsize::new(0));
        let children = (0..4).map(|i| file(&format!("f{}", i), b"x")).collect();
        let cursor = CountingCursor {
            inner: PagedCursor::new("lazy", children, 2),
            calls: Arc::clone(&calls),
        };
        let mut leaves = enumerate(vec![Entry::dir("lazy", cursor)]);

        leaves.next().await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        leaves.next().await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        leaves.next().await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        leaves.next().await.unwrap().unwrap();
        assert!(leaves.next().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_cursor_refuses_second_traversal() {
        let mut cursor = PagedCursor::new("once", vec![file("a", b"")], 10);
        assert_eq!(cursor.next_page().await.unwrap().len(), 1);
        assert!(cursor.next_page().await.unwrap().is_empty());
        assert!(matches!(
            cursor.next_page().await,
            Err(EnumerationError::Exhausted(name)) if name == "once"
        ));
    }

    #[tokio::test]
    async fn count_pass_matches_independent_upload_pass() {
        let build = || {
            vec![
                dir("x", vec![file("1", b"abc"), dir("y", vec![file("2", b"de")])]),
                file("3", b"f"),
            ]
        };
        let count = count_leaves(build()).await;
        let uploaded = collect_paths(build()).await;
        assert_eq!(count.leaves, uploaded.len() as u64);
        assert_eq!(count.bytes, 6);
        assert_eq!(count.errors, 0);
    }

    #[tokio::test]
    async fn empty_container_yields_nothing() {
        let count = count_leaves(vec![dir("empty", vec![])]).await;
        assert_eq!(count, LeafCount::default());
    }
}
