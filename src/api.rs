use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{
    app_state::{AppState, Status, SESION_POR_DEFECTO},
    catastro_client::OpcionesConsulta,
    error::{Error, ValidationError},
    models::{ConsolidatedReport, ParcelReport, TipoInforme},
    pipeline::{Lista, Resolucion, ResultadoCalculo, ResultadoGuardado, Sesion, CLAVE_HISTORIAL, CLAVE_PRECIOS},
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ConsolidarPayload {
    reportes: Vec<ParcelReport>,
}

#[derive(Deserialize)]
pub struct ResolverPayload {
    direccion: String,
    #[serde(default)]
    opciones: OpcionesConsulta,
    #[serde(default)]
    confirmado: bool,
}

#[derive(Serialize)]
#[serde(tag = "estado", rename_all = "snake_case")]
pub enum ResolverResponse {
    Informe { informe: ParcelReport },
    EnProceso,
    Conflicto { informe_id: String },
}

#[derive(Deserialize)]
pub struct CalcularPayload {
    reporte: ParcelReport,
}

#[derive(Serialize)]
pub struct CalcularResponse {
    reporte: Option<ParcelReport>,
    calculado: bool,
    cancelado: bool,
    aviso: Option<String>,
}

#[derive(Deserialize)]
pub struct HistorialPayload {
    direccion: String,
}

#[derive(Deserialize)]
pub struct GuardarPayload {
    reporte: ParcelReport,
    tipo: TipoInforme,
}

#[derive(Serialize)]
pub struct GuardarResponse {
    guardado: bool,
    id: Option<String>,
    motivo: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/sesiones", post(nueva_sesion_handler))
        .route("/api/sesion", delete(eliminar_sesion_handler))
        .route("/api/consolidar", post(consolidar_handler))
        .route("/api/resolver", post(resolver_handler))
        .route("/api/calcular", post(calcular_handler))
        .route("/api/compartidos/:token", get(compartido_handler))
        .route("/api/historial", get(historial_handler).post(agregar_historial_handler))
        .route("/api/precios", get(precios_handler).delete(refrescar_precios_handler))
        .route("/api/guardar", post(guardar_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

fn id_de_sesion(headers: &HeaderMap) -> &str {
    headers
        .get("x-sesion")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(SESION_POR_DEFECTO)
}

/// Las sesiones sólo se crean con `POST /api/sesiones`; un id desconocido es 404.
fn sesion_de(state: &AppState, headers: &HeaderMap) -> Result<Arc<Sesion>, ApiError> {
    let id = id_de_sesion(headers);
    state
        .sesion(id)
        .ok_or_else(|| error_json(StatusCode::NOT_FOUND, format!("sesión desconocida: {id}")))
}

fn error_json(status: StatusCode, mensaje: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": mensaje.to_string() })))
}

fn error_de_validacion(err: ValidationError) -> ApiError {
    error_json(StatusCode::UNPROCESSABLE_ENTITY, err)
}

fn error_de_api(err: Error) -> ApiError {
    match err {
        Error::Validation(err) => error_de_validacion(err),
        Error::Persistence(_) => {
            error!("Error de persistencia: {}", err);
            error_json(StatusCode::BAD_GATEWAY, err)
        }
        otro => {
            error!("Error contra la API del catastro: {}", otro);
            error_json(StatusCode::BAD_GATEWAY, otro)
        }
    }
}

// --- Handlers ---

#[axum::debug_handler]
async fn nueva_sesion_handler(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    match state.crear_sesion() {
        Some(id) => Ok((StatusCode::CREATED, Json(json!({ "sesion": id })))),
        None => Err(error_json(
            StatusCode::SERVICE_UNAVAILABLE,
            "demasiadas sesiones abiertas; cierre alguna con DELETE /api/sesion",
        )),
    }
}

#[axum::debug_handler]
async fn eliminar_sesion_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let id = id_de_sesion(&headers);
    if state.eliminar_sesion(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_json(StatusCode::NOT_FOUND, format!("sesión desconocida: {id}")))
    }
}

#[axum::debug_handler]
async fn consolidar_handler(
    State(state): State<AppState>,
    Json(payload): Json<ConsolidarPayload>,
) -> Result<Json<ConsolidatedReport>, ApiError> {
    state
        .servicio
        .validate_and_consolidate(&payload.reportes)
        .map(Json)
        .map_err(error_de_validacion)
}

#[axum::debug_handler]
async fn resolver_handler(
    State(state): State<AppState>,
    Json(payload): Json<ResolverPayload>,
) -> Result<Json<ResolverResponse>, ApiError> {
    let resolucion = state
        .servicio
        .resolve_address(&payload.direccion, payload.opciones, payload.confirmado)
        .await
        .map_err(error_de_api)?;

    let respuesta = match resolucion {
        Resolucion::Informe(informe) => ResolverResponse::Informe { informe: *informe },
        Resolucion::EnProceso => ResolverResponse::EnProceso,
        Resolucion::Conflicto { informe_id } => ResolverResponse::Conflicto { informe_id },
    };
    Ok(Json(respuesta))
}

#[axum::debug_handler]
async fn calcular_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CalcularPayload>,
) -> Result<Json<CalcularResponse>, ApiError> {
    let sesion = sesion_de(&state, &headers)?;
    let _ocupado = state.iniciar_calculo(format!("Calculando parcela {}...", payload.reporte.smp));

    let resultado = state
        .servicio
        .retrieve_calculation(&sesion, payload.reporte)
        .await;

    let respuesta = match resultado {
        ResultadoCalculo::Calculado(reporte) => CalcularResponse {
            reporte: Some(reporte),
            calculado: true,
            cancelado: false,
            aviso: None,
        },
        ResultadoCalculo::SinCalculo { informe, aviso } => CalcularResponse {
            reporte: Some(informe),
            calculado: false,
            cancelado: false,
            aviso: Some(aviso),
        },
        ResultadoCalculo::Cancelado => CalcularResponse {
            reporte: None,
            calculado: false,
            cancelado: true,
            aviso: None,
        },
    };

    Ok(Json(respuesta))
}

#[axum::debug_handler]
async fn compartido_handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ParcelReport>, ApiError> {
    match state.servicio.get_or_fetch_shared(&token).await {
        Ok(informe) => Ok(Json(informe.as_ref().clone())),
        Err(e) => {
            error!("Error cargando el informe compartido {}: {}", token, e);
            Err(error_json(StatusCode::BAD_GATEWAY, e))
        }
    }
}

async fn lista(state: &AppState, clave: &str) -> Result<Json<Lista>, ApiError> {
    state
        .servicio
        .get_or_fetch_list(clave)
        .await
        .map(|lista| Json(lista.as_ref().clone()))
        .map_err(|e| {
            error!("Error cargando la lista {}: {}", clave, e);
            error_json(StatusCode::BAD_GATEWAY, e)
        })
}

#[axum::debug_handler]
async fn historial_handler(State(state): State<AppState>) -> Result<Json<Lista>, ApiError> {
    lista(&state, CLAVE_HISTORIAL).await
}

#[axum::debug_handler]
async fn precios_handler(State(state): State<AppState>) -> Result<Json<Lista>, ApiError> {
    lista(&state, CLAVE_PRECIOS).await
}

#[axum::debug_handler]
async fn refrescar_precios_handler(State(state): State<AppState>) -> StatusCode {
    state.servicio.invalidate_list(CLAVE_PRECIOS);
    StatusCode::NO_CONTENT
}

#[axum::debug_handler]
async fn agregar_historial_handler(
    State(state): State<AppState>,
    Json(payload): Json<HistorialPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .servicio
        .append_history(&payload.direccion)
        .await
        .map_err(error_de_api)?;
    Ok(StatusCode::CREATED)
}

#[axum::debug_handler]
async fn guardar_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GuardarPayload>,
) -> Result<Json<GuardarResponse>, ApiError> {
    let sesion = sesion_de(&state, &headers)?;
    let resultado = state
        .servicio
        .save(&sesion, &payload.reporte, payload.tipo)
        .await
        .map_err(error_de_api)?;

    let respuesta = match resultado {
        ResultadoGuardado::Guardado { id } => GuardarResponse {
            guardado: true,
            id: Some(id),
            motivo: None,
        },
        ResultadoGuardado::Omitido(rechazo) => GuardarResponse {
            guardado: false,
            id: None,
            motivo: Some(format!("{rechazo:?}")),
        },
    };
    Ok(Json(respuesta))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let sesiones = state.sesiones.lock().map(|s| s.len()).unwrap_or_default();
    let mut status = state
        .status
        .lock()
        .map(|s| s.clone())
        .unwrap_or_default();
    status.sesiones = sesiones;
    Json(status)
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state
        .shutdown_sender
        .lock()
        .ok()
        .and_then(|mut s| s.take())
    {
        let _ = sender.send(());
    }
    StatusCode::OK
}
