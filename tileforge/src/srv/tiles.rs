use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use actix_web::web::{self, Data};
use actix_web::{HttpRequest, HttpResponse};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use tileforge_core::render::{OutputFormat, RenderOutput, RenderRequest, SubtileRequest};
use tileforge_core::{Metatile, MvtTile, TileData, TileId};

use crate::data::ProviderError;
use crate::endpoints::{EndpointKind, EndpointParams};

use super::ServerState;

/// Default service: routes any request through the endpoint table.
///
/// The table pointer is loaded exactly once per request; a concurrent config
/// swap never tears the view this handler works against.
pub async fn serve_tile(req: HttpRequest, state: Data<ServerState>) -> HttpResponse {
    let endpoints = state.endpoints.load_full();
    let path = req.path();
    let Some((prefix, variants)) = endpoints.resolve(path) else {
        return HttpResponse::NotFound().finish();
    };
    let Some((tile, extension)) = parse_tile_path(&path[prefix.len()..]) else {
        return HttpResponse::BadRequest().body("expected <z>/<x>/<y>[.<ext>]");
    };
    if !tile.is_valid() {
        return HttpResponse::BadRequest().body("invalid tile coordinates");
    }
    let Some(params) = select_variant(variants, tile.z, &extension) else {
        return HttpResponse::NotFound().finish();
    };

    let cacheable = params.kind != EndpointKind::StaticFiles;
    if cacheable {
        if let Some(cacher) = &state.cacher {
            if let Some(data) = cacher.get(path).await {
                debug!("Cache hit for {path}");
                return ok_response(data, cached_content_type(&extension));
            }
        }
    }

    let outcome = match params.kind {
        EndpointKind::Render => render_tile(&state, params, &req, tile, &extension).await,
        EndpointKind::Mvt => mvt_tile(&state, params, tile).await,
        EndpointKind::StaticFiles => static_tile(&state, params, tile).await,
    };
    match outcome {
        Ok((data, content_type)) => {
            if cacheable {
                if let Some(cacher) = &state.cacher {
                    cacher.put(path.to_string(), data.clone()).await;
                }
            }
            ok_response(data, content_type)
        }
        Err(response) => response,
    }
}

type TileOutcome = Result<(TileData, &'static str), HttpResponse>;

async fn render_tile(
    state: &ServerState,
    params: &EndpointParams,
    req: &HttpRequest,
    tile: TileId,
    extension: &str,
) -> TileOutcome {
    let render_grid = extension == "grid.json";
    if render_grid && !params.allow_utf_grid {
        return Err(HttpResponse::NotFound().finish());
    }
    let layers = if params.allow_layers_query {
        web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .ok()
            .map(web::Query::into_inner)
            .and_then(|mut query| query.remove("layers"))
    } else {
        None
    };
    let metatile = if params.auto_metatile_size {
        match state.data.get(&params.provider_name) {
            Some(provider) => provider.metatile_hint(),
            None => {
                warn!(
                    "Provider {} is not available for auto metatile sizing",
                    params.provider_name
                );
                Metatile::default()
            }
        }
    } else {
        Metatile::new(params.metatile_width, params.metatile_height)
    };

    let request = RenderRequest {
        style_name: params.style_name.clone(),
        tile,
        metatile,
        layers,
        render_grid,
        utfgrid_key: render_grid.then(|| params.utfgrid_key.clone()),
    };
    match await_task(state, request).await {
        Some(output) => Ok((output.data, output.format.content_type())),
        None => Err(HttpResponse::InternalServerError().finish()),
    }
}

async fn mvt_tile(state: &ServerState, params: &EndpointParams, tile: TileId) -> TileOutcome {
    let Some(provider) = state.data.get(&params.provider_name) else {
        warn!("Provider {} is not available", params.provider_name);
        return Err(HttpResponse::NotFound().finish());
    };
    let data_zoom = data_zoom_for(tile.z, params.zoom_offset, provider.data_maxzoom());
    let filter = params.filter_table.clone();

    if data_zoom >= tile.z {
        let blob = fetch_blocking(Arc::clone(&provider), tile, filter).await?;
        return Ok((blob, OutputFormat::Mvt.content_type()));
    }

    // the provider has no data this deep: fetch the ancestor and derive the
    // subtile on the render pool (overzoom)
    let shift = tile.z - data_zoom;
    let parent = TileId::new(data_zoom, tile.x >> shift, tile.y >> shift);
    let blob = fetch_blocking(Arc::clone(&provider), parent, filter).await?;

    let (sender, receiver) = oneshot::channel();
    let sender = shared_sender(sender);
    let on_success = {
        let sender = Arc::clone(&sender);
        move |output: RenderOutput| send_once(&sender, Some(output))
    };
    let on_error = move || send_once(&sender, None);
    state.render.make_subtile(
        SubtileRequest {
            mvt_tile: MvtTile {
                id: parent,
                data: blob,
            },
            target: tile,
        },
        on_success,
        on_error,
    );
    match receiver.await {
        Ok(Some(output)) => Ok((output.data, output.format.content_type())),
        Ok(None) | Err(_) => Err(HttpResponse::InternalServerError().finish()),
    }
}

async fn static_tile(state: &ServerState, params: &EndpointParams, tile: TileId) -> TileOutcome {
    let Some(provider) = state.data.get(&params.provider_name) else {
        warn!("Provider {} is not available", params.provider_name);
        return Err(HttpResponse::NotFound().finish());
    };
    let content_type = provider.content_type();
    let blob = fetch_blocking(provider, tile, None).await?;
    Ok((blob, content_type))
}

/// Runs a provider fetch on the blocking pool so I/O threads never stall.
async fn fetch_blocking(
    provider: Arc<dyn crate::data::DataProvider>,
    tile: TileId,
    filter: Option<Arc<crate::filters::FilterTable>>,
) -> Result<TileData, HttpResponse> {
    let fetched = web::block(move || provider.fetch(tile, filter.as_deref())).await;
    match fetched {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(ProviderError::NoTile(tile))) => {
            debug!("No data for {tile}");
            Err(HttpResponse::NoContent().finish())
        }
        Ok(Err(e)) => {
            error!("{e}");
            Err(HttpResponse::InternalServerError().finish())
        }
        Err(e) => {
            error!("{e}");
            Err(HttpResponse::InternalServerError().finish())
        }
    }
}

/// Posts a render and awaits whichever callback fires.
async fn await_task(state: &ServerState, request: RenderRequest) -> Option<RenderOutput> {
    let (sender, receiver) = oneshot::channel();
    let sender = shared_sender(sender);
    let on_success = {
        let sender = Arc::clone(&sender);
        move |output: RenderOutput| send_once(&sender, Some(output))
    };
    let on_error = move || send_once(&sender, None);
    state.render.render(request, on_success, on_error);
    receiver.await.ok().flatten()
}

type SharedSender = Arc<Mutex<Option<oneshot::Sender<Option<RenderOutput>>>>>;

fn shared_sender(sender: oneshot::Sender<Option<RenderOutput>>) -> SharedSender {
    Arc::new(Mutex::new(Some(sender)))
}

fn send_once(sender: &SharedSender, output: Option<RenderOutput>) {
    let sender = sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(output);
    }
}

fn ok_response(data: TileData, content_type: &'static str) -> HttpResponse {
    if data.is_empty() {
        return HttpResponse::NoContent().finish();
    }
    HttpResponse::Ok().content_type(content_type).body(data)
}

/// First variant whose zoom range covers the tile and whose kind can answer
/// the requested extension.
fn select_variant<'v>(
    variants: &'v [Arc<EndpointParams>],
    zoom: u8,
    extension: &str,
) -> Option<&'v EndpointParams> {
    variants
        .iter()
        .find(|params| {
            params.minzoom <= zoom
                && zoom <= params.maxzoom
                && match params.kind {
                    EndpointKind::Render => {
                        matches!(extension, "" | "png" | "grid.json")
                    }
                    EndpointKind::Mvt => matches!(extension, "mvt" | "pbf"),
                    EndpointKind::StaticFiles => true,
                }
        })
        .map(Arc::as_ref)
}

fn cached_content_type(extension: &str) -> &'static str {
    match extension {
        "" | "png" => OutputFormat::Png.content_type(),
        "mvt" | "pbf" => OutputFormat::Mvt.content_type(),
        "grid.json" => OutputFormat::UtfGrid.content_type(),
        _ => "application/octet-stream",
    }
}

fn data_zoom_for(zoom: u8, offset: i32, data_maxzoom: u8) -> u8 {
    let shifted = i32::from(zoom) + offset;
    u8::try_from(shifted.clamp(0, i32::from(data_maxzoom))).unwrap_or(0)
}

/// Parses the `<z>/<x>/<y>[.<ext>]` suffix below an endpoint path.
fn parse_tile_path(rest: &str) -> Option<(TileId, String)> {
    let mut segments = rest.split('/');
    let z = segments.next()?.parse().ok()?;
    let x = segments.next()?.parse().ok()?;
    let last = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let (y, extension) = match last.split_once('.') {
        Some((y, extension)) => (y, extension.to_string()),
        None => (last, String::new()),
    };
    Some((TileId::new(z, x, y.parse().ok()?), extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_params(minzoom: u8, maxzoom: u8) -> Arc<EndpointParams> {
        Arc::new(EndpointParams {
            kind: EndpointKind::Render,
            minzoom,
            maxzoom,
            zoom_offset: 0,
            provider_name: String::new(),
            style_name: "base".to_string(),
            allow_layers_query: false,
            allow_utf_grid: false,
            utfgrid_key: String::new(),
            auto_metatile_size: false,
            metatile_width: 1,
            metatile_height: 1,
            filter_map: None,
            filter_table: None,
        })
    }

    #[test]
    fn tile_path_parsing() {
        assert_eq!(
            parse_tile_path("3/1/2.png"),
            Some((TileId::new(3, 1, 2), "png".to_string()))
        );
        assert_eq!(
            parse_tile_path("3/1/2"),
            Some((TileId::new(3, 1, 2), String::new()))
        );
        assert_eq!(
            parse_tile_path("14/100/200.grid.json"),
            Some((TileId::new(14, 100, 200), "grid.json".to_string()))
        );
        assert_eq!(parse_tile_path("3/1"), None);
        assert_eq!(parse_tile_path("3/1/2/4"), None);
        assert_eq!(parse_tile_path("a/b/c.png"), None);
        assert_eq!(parse_tile_path("-1/0/0.png"), None);
    }

    #[test]
    fn variant_selection_respects_zoom_and_kind() {
        let variants = vec![render_params(0, 5), render_params(6, 19)];
        assert!(std::ptr::eq(
            select_variant(&variants, 3, "png").unwrap(),
            variants[0].as_ref()
        ));
        assert!(std::ptr::eq(
            select_variant(&variants, 10, "png").unwrap(),
            variants[1].as_ref()
        ));
        assert!(select_variant(&variants, 3, "mvt").is_none());

        // inverted range never matches; rejection happens here, not at parse
        let inverted = vec![render_params(10, 5)];
        assert!(select_variant(&inverted, 7, "png").is_none());
    }

    #[test]
    fn data_zoom_clamps_to_provider_depth() {
        assert_eq!(data_zoom_for(10, 0, 14), 10);
        assert_eq!(data_zoom_for(16, 0, 14), 14);
        assert_eq!(data_zoom_for(10, -2, 14), 8);
        assert_eq!(data_zoom_for(1, -4, 14), 0);
        assert_eq!(data_zoom_for(10, 2, 14), 12);
    }
}
