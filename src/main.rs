use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

use treeput::config::Config;
use treeput::manage::{self, RenameOutcome};
use treeput::progress::{format_bytes, progress_line};
use treeput::scheduler::TaskId;
use treeput::{logging, upload_batch, LocalRoots, TaskOutcome, TransferBatch, UploadEvent, Uploader};

#[derive(Debug, Parser)]
#[command(name = "treeput", version, about = "Upload files and directory trees with HTTP PUT")]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "TREEPUT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, env = "TREEPUT_LOG", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload files and directories into a remote directory
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Destination directory URL
        #[arg(long, env = "TREEPUT_URL")]
        to: Option<String>,

        /// Upper bound on simultaneous uploads (unbounded by default)
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Register files as they are discovered instead of counting first
        #[arg(long)]
        no_count: bool,

        /// Do not send the X-Last-Modified header
        #[arg(long)]
        no_mtime: bool,

        /// Directory entries read per page
        #[arg(long)]
        page_size: Option<usize>,

        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a directory (MKCOL)
    Mkdir { dir_url: String, name: String },
    /// Delete a file or directory (DELETE)
    Rm { url: String },
    /// Rename an entry inside a directory (MOVE)
    Mv { dir_url: String, from: String, to: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. 读取配置，命令行参数覆盖配置文件
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Command::Upload {
        to,
        max_in_flight,
        no_count,
        no_mtime,
        page_size,
        ..
    } = &cli.command
    {
        let upload = &mut config.upload;
        if let Some(to) = to {
            upload.base_url = Some(to.clone());
        }
        if max_in_flight.is_some() {
            upload.max_in_flight = *max_in_flight;
        }
        if let Some(page_size) = page_size {
            upload.page_size = *page_size;
        }
        upload.count_first &= !no_count;
        upload.send_last_modified &= !no_mtime;
    }
    config.validate()?;

    // 2. 初始化日志
    let _guard = logging::init(&config.log)?;

    // 3. 创建 HTTP 客户端
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.upload.connect_timeout() {
        builder = builder.connect_timeout(timeout);
    }
    let client = builder.build().context("failed to build HTTP client")?;

    // 4. 执行子命令
    match cli.command {
        Command::Upload { paths, json, .. } => run_upload(client, &config, paths, json).await,
        Command::Mkdir { dir_url, name } => {
            let url = manage::mkdir(&client, &dir_url, &name).await?;
            println!("created {}", url);
            Ok(())
        }
        Command::Rm { url } => {
            manage::delete(&client, &url).await?;
            println!("deleted {}", url);
            Ok(())
        }
        Command::Mv { dir_url, from, to } => {
            match manage::rename(&client, &dir_url, &from, &to).await? {
                RenameOutcome::Moved => println!("moved {} -> {}", from, to),
                RenameOutcome::Unchanged => println!("{} unchanged", from),
            }
            Ok(())
        }
    }
}

async fn run_upload(client: reqwest::Client, config: &Config, paths: Vec<PathBuf>, json: bool) -> Result<()> {
    let base_url = config
        .upload
        .base_url
        .clone()
        .ok_or_else(|| anyhow!("no destination URL, pass --to or set upload.base_url"))?;

    let (events, receiver) = mpsc::unbounded_channel();
    let uploader = Uploader::new(client, &base_url, config.upload.options()).with_events(events);

    // Ctrl-C 取消整批上传，已取消的任务照样计入完成
    let cancel = uploader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling uploads");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(print_events(receiver, !json));
    let source = LocalRoots::new(paths).with_page_size(config.upload.page_size);
    let batch = TransferBatch::new();
    let result = upload_batch(&uploader, &source, &batch, config.upload.count_mode()).await;

    // 所有发送端释放后打印任务才会结束
    drop(uploader);
    let _ = printer.await;
    let report = result?;

    let summary = report.summary;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for err in &report.enumeration_errors {
            eprintln!("skipped: {}", err);
        }
        println!(
            "{} uploaded, {} failed, {} cancelled",
            summary.succeeded, summary.failed, summary.cancelled
        );
    }

    if summary.any_failed || !report.enumeration_errors.is_empty() {
        return Err(anyhow!(
            "{} of {} uploads did not succeed, {} entries unreadable",
            summary.failed + summary.cancelled,
            summary.expected,
            report.enumeration_errors.len()
        ));
    }
    Ok(())
}

async fn print_events(mut receiver: mpsc::UnboundedReceiver<UploadEvent>, show: bool) {
    let mut names: HashMap<TaskId, String> = HashMap::new();
    while let Some(event) = receiver.recv().await {
        match event {
            UploadEvent::Started { id, path, size, .. } => {
                if show {
                    println!("{} ({})", path, format_bytes(size));
                }
                names.insert(id, path);
            }
            UploadEvent::Progress { id, report } => {
                if let (true, Some(name)) = (show, names.get(&id)) {
                    println!("{}: {}", name, progress_line(&report));
                }
            }
            UploadEvent::Finished { id, path, outcome } => {
                names.remove(&id);
                match outcome {
                    TaskOutcome::Succeeded { .. } if show => println!("{}: Done", path),
                    TaskOutcome::Failed(err) => eprintln!("{}: {}", path, err),
                    TaskOutcome::Cancelled if show => println!("{}: cancelled", path),
                    _ => {}
                }
            }
            UploadEvent::BatchComplete(summary) => {
                info!(expected = summary.expected, any_failed = summary.any_failed, "all uploads finished");
            }
        }
    }
}
