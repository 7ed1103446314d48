use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use spectra_api::cache::ResponseCache;
use spectra_api::catalog::release::TableKind;
use spectra_api::catalog::{mmap_table, store, CatalogService, PreloadCache, Table};
use spectra_api::config::Config;
use spectra_api::query::{AppContext, QueryServer};

#[derive(Parser)]
#[command(name = "spectra-api", version, about = "Tiered spectral catalog retrieval API")]
struct Cli {
    /// TOML 配置文件路径
    #[arg(short, long, default_value = "/config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 启动 HTTP 查询服务
    Server,
    /// 删除访问时间过旧的缓存条目（交给外部调度器周期触发）
    CleanCache,
    /// 缓存总量超限时整树清空（外部调度器按小时触发）
    EmergencyCleanCache,
    /// 从 canonical 表物化 mmap 层（缺省处理预载白名单里的 release）
    Convert {
        #[arg(short, long)]
        release: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Command::Server => run_server(cfg).await,
        Command::CleanCache => {
            if cfg.cache.max_age == 0 {
                info!("cache.max_age is 0 (never stale), nothing to clean");
                return Ok(());
            }
            let cache = ResponseCache::new(cfg.cache_root());
            let removed = cache.clean(chrono::Duration::minutes(cfg.cache.max_age))?;
            info!("removed {} cache files", removed);
            Ok(())
        }
        Command::EmergencyCleanCache => {
            let cache = ResponseCache::new(cfg.cache_root());
            let evicted = cache.emergency_evict(cfg.max_cache_size_bytes()?)?;
            info!("emergency eviction triggered: {}", evicted);
            Ok(())
        }
        Command::Convert { release } => convert(&cfg, release),
    }
}

async fn run_server(cfg: Config) -> anyhow::Result<()> {
    info!("starting spectra-api query server");

    // 分区 fan-out 的并行度上限在启动时定死
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global();

    // 预载层只在这里初始化一次；之后所有 worker 共享同一份只读引用
    let preload = PreloadCache::init_global(
        &cfg.preload.releases,
        std::path::Path::new(&cfg.data.spectro_redux),
        std::path::Path::new(&cfg.data.derived_dir),
    );

    let ctx = Arc::new(AppContext {
        catalog: CatalogService::new(&cfg.data, preload),
        cache: ResponseCache::new(cfg.cache_root()),
        cache_max_age: chrono::Duration::minutes(cfg.cache.max_age),
    });

    let server = QueryServer::new(ctx);
    let host = cfg.server.host.clone();
    let port = cfg.server.port;
    tokio::spawn(async move {
        if let Err(e) = server.run(&host, port).await {
            tracing::error!("query server exited: {}", e);
        }
    });

    info!(
        "spectra-api ready. Query via: http://{}:{}/api/v1/zcat/download/<release>/targets/<ids>",
        cfg.server.host, cfg.server.port
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    Ok(())
}

/// 读 canonical 表，重写派生的定宽 mmap 文件与布局描述。
/// 单个表失败只记日志，继续处理其余表。
fn convert(cfg: &Config, releases: Vec<String>) -> anyhow::Result<()> {
    let names = if releases.is_empty() {
        cfg.preload.releases.clone()
    } else {
        releases
    };

    let data_root = std::path::Path::new(&cfg.data.spectro_redux);
    let derived = std::path::Path::new(&cfg.data.derived_dir);

    for name in &names {
        let layout = spectra_api::catalog::ReleaseLayout::new(data_root, derived, name);
        for kind in [TableKind::Healpix, TableKind::Tile] {
            let src = layout.canonical_table(kind);
            match store::read_framed::<Table>(&src) {
                Ok(table) => {
                    mmap_table::write_mmap_pair(
                        &layout.mmap_data(kind),
                        &layout.mmap_layout(kind),
                        &table,
                    )?;
                    info!("converted {}/{:?}: {} rows", layout.name, kind, table.n_rows());
                }
                Err(e) => tracing::warn!("skipping {}/{:?}: {}", layout.name, kind, e),
            }
        }
    }
    Ok(())
}
