pub mod fetch;
pub mod merge;
pub mod stack;

pub use fetch::{PartitionFile, PartitionResult, WaveGrid};
pub use stack::StackedSpectra;

use crate::catalog::zcat;
use crate::catalog::CatalogService;
use crate::error::ApiError;
use crate::query::request::{ApiRequest, QueryParams};

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::ServerFailed(e.to_string())
}

/// 光谱入口：先做目录行选择（含过滤），再按分区取谱、合并、叠加。
///
/// 调用方顺序 = 选择后目录行的行序；合并阶段保证光谱与目录行逐行对应。
pub fn handle_spectra(svc: &CatalogService, req: &ApiRequest) -> Result<StackedSpectra, ApiError> {
    let name = crate::query::request::canonise_release_name(&req.release)?;
    let release = svc.release(&name);

    let targets = zcat::handle_zcatalog(svc, req)?;
    tracing::info!("retrieving spectra for {} objects", targets.n_rows());

    match &req.params {
        QueryParams::Targets { .. } | QueryParams::Radec { .. } => {
            let ids = targets.int_column("TARGETID").map_err(internal)?.to_vec();
            let parts = fetch::fetch_healpix_partitions(&release, &targets)?;
            stack::stack_partitions(&ids, targets, parts, "TARGETID")
        }
        QueryParams::Tile { tile, .. } => {
            let ids = targets.int_column("FIBER").map_err(internal)?.to_vec();
            let parts = fetch::fetch_tile_partitions(&release, *tile, &ids)?;
            stack::stack_partitions(&ids, targets, parts, "FIBER")
        }
    }
}
