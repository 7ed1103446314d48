use std::collections::{BTreeMap, HashSet};

use roaring::RoaringBitmap;

use crate::catalog::release::{ReleaseLayout, TableKind};
use crate::catalog::table::Table;
use crate::catalog::tiered::CatalogService;
use crate::error::ApiError;
use crate::query::filter;
use crate::query::request::{ApiRequest, QueryParams};

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::ServerFailed(e.to_string())
}

/// 目录行入口：按查询形态分发。返回的行已做主行选择 + 过滤。
pub fn handle_zcatalog(svc: &CatalogService, req: &ApiRequest) -> Result<Table, ApiError> {
    let name = crate::query::request::canonise_release_name(&req.release)?;
    let release = svc.release(&name);
    match &req.params {
        QueryParams::Targets { target_ids } => {
            get_target_zcatalog(svc, &release, target_ids, &req.filters)
        }
        QueryParams::Tile { tile, fibers } => {
            get_tile_zcatalog(svc, &release, *tile, fibers, &req.filters)
        }
        QueryParams::Radec { ra, dec, radius } => {
            get_radec_zcatalog(svc, &release, *ra, *dec, *radius, &req.filters)
        }
    }
}

/// id 查询的行选择：ZCAT_PRIMARY ∧ id ∈ 请求集合；
/// 不给 id 时只看主行标记。请求的 id 找不到必须上报，不允许静默丢弃。
pub fn get_target_zcatalog(
    svc: &CatalogService,
    release: &ReleaseLayout,
    target_ids: &[i64],
    filters: &BTreeMap<String, String>,
) -> Result<Table, ApiError> {
    let mut desired = TableKind::Healpix.base_columns();
    desired.extend(filter::data_filter_columns(filters));

    let full = svc.resolve(release, TableKind::Healpix, &desired)?;

    let primary = full.bool_column("ZCAT_PRIMARY").map_err(internal)?;
    let tids = full.int_column("TARGETID").map_err(internal)?;
    let requested: HashSet<i64> = target_ids.iter().copied().collect();

    let mut keep = RoaringBitmap::new();
    for (i, (&p, &tid)) in primary.iter().zip(tids.iter()).enumerate() {
        if p && (requested.is_empty() || requested.contains(&tid)) {
            keep.insert(i as u32);
        }
    }
    let selected = full.filter(&keep).map_err(internal)?;

    if !target_ids.is_empty() {
        let found: HashSet<i64> = selected
            .int_column("TARGETID")
            .map_err(internal)?
            .iter()
            .copied()
            .collect();
        let missing: Vec<i64> = target_ids
            .iter()
            .copied()
            .filter(|t| !found.contains(t))
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::not_found(format!(
                "unable to find targets: {:?}",
                missing
            )));
        }
    }

    filter::apply_filters(&selected, filters)
}

/// tile 查询的行选择：TILEID 相等 ∧ FIBER ∈ 请求集合。
/// 请求的 fiber 在该 tile 下没有行同样是 DataNotFound。
pub fn get_tile_zcatalog(
    svc: &CatalogService,
    release: &ReleaseLayout,
    tile: i64,
    fibers: &[i64],
    filters: &BTreeMap<String, String>,
) -> Result<Table, ApiError> {
    let mut desired = TableKind::Tile.base_columns();
    desired.extend(filter::data_filter_columns(filters));

    let full = svc.resolve(release, TableKind::Tile, &desired)?;

    let tile_ids = full.int_column("TILEID").map_err(internal)?;
    let fiber_col = full.int_column("FIBER").map_err(internal)?;
    let requested: HashSet<i64> = fibers.iter().copied().collect();

    let mut keep = RoaringBitmap::new();
    for (i, (&t, &f)) in tile_ids.iter().zip(fiber_col.iter()).enumerate() {
        if t == tile && (requested.is_empty() || requested.contains(&f)) {
            keep.insert(i as u32);
        }
    }
    let selected = full.filter(&keep).map_err(internal)?;

    if !fibers.is_empty() {
        let found: HashSet<i64> = selected
            .int_column("FIBER")
            .map_err(internal)?
            .iter()
            .copied()
            .collect();
        let missing: Vec<i64> = fibers
            .iter()
            .copied()
            .filter(|f| !found.contains(f))
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::not_found(format!(
                "unable to locate fibers on tile {}: {:?}",
                tile, missing
            )));
        }
    }

    filter::apply_filters(&selected, filters)
}

/// 位置检索：先取全部主行（带过滤），再按角距离圈出半径内的对象。
/// radius 单位是角秒，比较前换算成度。
pub fn get_radec_zcatalog(
    svc: &CatalogService,
    release: &ReleaseLayout,
    ra: f64,
    dec: f64,
    radius_arcsec: f64,
    filters: &BTreeMap<String, String>,
) -> Result<Table, ApiError> {
    let targets = get_target_zcatalog(svc, release, &[], filters)?;

    let ras = targets.float_column("TARGET_RA").map_err(internal)?;
    let decs = targets.float_column("TARGET_DEC").map_err(internal)?;
    let radius_deg = radius_arcsec / 3600.0;

    let mut keep = RoaringBitmap::new();
    for (i, (&tra, &tdec)) in ras.iter().zip(decs.iter()).enumerate() {
        if angular_separation_deg(ra, dec, tra, tdec) <= radius_deg {
            keep.insert(i as u32);
        }
    }
    targets.filter(&keep).map_err(internal)
}

/// 球面角距离（度），haversine 形式，极区与跨 0h 赤经都安全。
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (r1, d1) = (ra1.to_radians(), dec1.to_radians());
    let (r2, d2) = (ra2.to_radians(), dec2.to_radians());
    let sd = ((d2 - d1) / 2.0).sin();
    let sr = ((r2 - r1) / 2.0).sin();
    let a = sd * sd + d1.cos() * d2.cos() * sr * sr;
    2.0 * a.sqrt().min(1.0).asin().to_degrees()
}
