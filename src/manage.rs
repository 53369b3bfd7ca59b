//! 目录管理：新建目录、删除、重命名。每个操作只发一个请求。

use reqwest::{Client, Method, RequestBuilder};
use tracing::{debug, info};

use crate::error::{ManageError, Rejection};
use crate::path::{encode_uri_path, join_url};

pub const DESTINATION_HEADER: &str = "Destination";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Moved,
    /// 新旧名称相同，没有发请求
    Unchanged,
}

/// `MKCOL <dir_url>/<name>`
pub async fn mkdir(client: &Client, dir_url: &str, name: &str) -> Result<String, ManageError> {
    let url = join_url(dir_url, &encode_uri_path(name));
    send(client.request(webdav_method("MKCOL")?, &url)).await?;
    info!(url = %url, "directory created");
    Ok(url)
}

/// `DELETE <url>`
pub async fn delete(client: &Client, url: &str) -> Result<(), ManageError> {
    send(client.delete(url)).await?;
    info!(url = %url, "deleted");
    Ok(())
}

/// `MOVE <dir_url>/<from>`，目标放在 `Destination` 头里
pub async fn rename(client: &Client, dir_url: &str, from: &str, to: &str) -> Result<RenameOutcome, ManageError> {
    let from = from.strip_suffix('/').unwrap_or(from);
    let to = to.strip_suffix('/').unwrap_or(to);
    if from == to {
        // 服务器对同名移动会返回 403
        debug!(name = %from, "rename to same name skipped");
        return Ok(RenameOutcome::Unchanged);
    }

    let source = join_url(dir_url, &encode_uri_path(from));
    let destination = join_url(dir_url, &encode_uri_path(to));
    send(
        client
            .request(webdav_method("MOVE")?, &source)
            .header(DESTINATION_HEADER, destination.as_str()),
    )
    .await?;
    info!(from = %source, to = %destination, "renamed");
    Ok(RenameOutcome::Moved)
}

fn webdav_method(name: &'static str) -> Result<Method, ManageError> {
    Method::from_bytes(name.as_bytes()).map_err(|_| ManageError::Method(name))
}

async fn send(request: RequestBuilder) -> Result<(), ManageError> {
    let response = request.send().await?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(Rejection::from_response(response).await.into())
    }
}
