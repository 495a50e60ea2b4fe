use actix_web::http::header::ContentType;
use actix_web::web::Data;
use actix_web::{route, HttpResponse, Responder};

use super::ServerState;

/// Health endpoint read by probes and the load balancer: `ok` while serving,
/// `maintenance` while draining towards shutdown.
#[route("/mon", method = "GET")]
#[allow(clippy::unused_async)]
pub async fn get_mon(state: Data<ServerState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(state.monitor.status().as_str())
}
