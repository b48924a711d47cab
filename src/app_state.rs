use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::pipeline::{ServicioInformes, Sesion};

/// Sesión usada cuando la petición no trae cabecera `x-sesion`. Existe
/// siempre y no se puede eliminar.
pub const SESION_POR_DEFECTO: &str = "default";

const MENSAJE_LISTO: &str = "Servidor listo.";

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub servicio: Arc<ServicioInformes>,
    pub sesiones: Arc<Mutex<HashMap<String, Arc<Sesion>>>>,
    pub status: Arc<Mutex<Status>>,
    pub calculos_activos: Arc<AtomicUsize>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, servicio: ServicioInformes, shutdown_sender: oneshot::Sender<()>) -> Self {
        let mut sesiones = HashMap::new();
        sesiones.insert(SESION_POR_DEFECTO.to_string(), Arc::new(Sesion::new()));
        Self {
            config,
            servicio: Arc::new(servicio),
            sesiones: Arc::new(Mutex::new(sesiones)),
            status: Arc::new(Mutex::new(Status {
                is_busy: false,
                message: MENSAJE_LISTO.to_string(),
                sesiones: 1,
            })),
            calculos_activos: Arc::new(AtomicUsize::new(0)),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
        }
    }

    /// Abre una sesión nueva. `None` si ya se alcanzó el tope configurado.
    pub fn crear_sesion(&self) -> Option<String> {
        let mut sesiones = self.sesiones.lock().unwrap_or_else(|e| e.into_inner());
        if sesiones.len() >= self.config.max_sesiones.max(1) {
            warn!(abiertas = sesiones.len(), "tope de sesiones alcanzado");
            return None;
        }
        let id = Uuid::new_v4().to_string();
        sesiones.insert(id.clone(), Arc::new(Sesion::new()));
        debug!(sesion = %id, "sesión creada");
        Some(id)
    }

    /// Sesión `id`, si fue creada y sigue abierta.
    pub fn sesion(&self, id: &str) -> Option<Arc<Sesion>> {
        let sesiones = self.sesiones.lock().unwrap_or_else(|e| e.into_inner());
        sesiones.get(id).cloned()
    }

    /// Cierra la sesión: cancela su cálculo y la quita del mapa. La sesión
    /// por defecto sólo se reinicia. Devuelve `false` si no existía.
    pub fn eliminar_sesion(&self, id: &str) -> bool {
        let sesion = {
            let mut sesiones = self.sesiones.lock().unwrap_or_else(|e| e.into_inner());
            if id == SESION_POR_DEFECTO {
                sesiones.get(id).cloned()
            } else {
                sesiones.remove(id)
            }
        };
        match sesion {
            Some(sesion) => {
                sesion.reset();
                true
            }
            None => false,
        }
    }

    /// Marca el servidor como ocupado mientras viva el guardián devuelto.
    /// El estado vuelve a "listo" cuando termina el último cálculo de
    /// cualquier sesión.
    pub fn iniciar_calculo(&self, mensaje: impl Into<String>) -> CalculoActivo {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        self.calculos_activos.fetch_add(1, Ordering::SeqCst);
        status.is_busy = true;
        status.message = mensaje.into();
        drop(status);
        CalculoActivo { estado: self.clone() }
    }
}

/// Guardián de un cálculo en curso; ver [`AppState::iniciar_calculo`].
pub struct CalculoActivo {
    estado: AppState,
}

impl Drop for CalculoActivo {
    fn drop(&mut self) {
        // Mismo cerrojo que `iniciar_calculo`.
        let mut status = self.estado.status.lock().unwrap_or_else(|e| e.into_inner());
        let restantes = self.estado.calculos_activos.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if restantes == 0 {
            status.is_busy = false;
            status.message = MENSAJE_LISTO.to_string();
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub sesiones: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catastro_client::HttpCatastroClient;

    fn estado(max_sesiones: &str) -> AppState {
        let cfg = AppConfig::from_lookup(|clave| match clave {
            "CATASTRO_API_URL" => Some("https://catastro.example/".to_string()),
            "MAX_SESIONES" => Some(max_sesiones.to_string()),
            _ => None,
        })
        .unwrap();
        let cliente = HttpCatastroClient::from_config(&cfg).unwrap();
        let servicio = ServicioInformes::new(Arc::new(cliente), cfg.backoff(), cfg.shared_cache_ttl());
        let (tx, _rx) = oneshot::channel();
        AppState::new(cfg, servicio, tx)
    }

    fn abiertas(estado: &AppState) -> usize {
        estado.sesiones.lock().unwrap().len()
    }

    #[test]
    fn unknown_session_ids_are_not_created() {
        let estado = estado("8");
        assert!(estado.sesion(SESION_POR_DEFECTO).is_some());
        assert!(estado.sesion("inventada").is_none());
        assert!(estado.sesion("inventada").is_none());
        assert_eq!(abiertas(&estado), 1);
    }

    #[test]
    fn deleting_a_session_removes_it() {
        let estado = estado("8");
        let id = estado.crear_sesion().unwrap();
        assert!(estado.sesion(&id).is_some());
        assert_eq!(abiertas(&estado), 2);

        assert!(estado.eliminar_sesion(&id));
        assert!(estado.sesion(&id).is_none());
        assert!(!estado.eliminar_sesion(&id));
        assert_eq!(abiertas(&estado), 1);

        assert!(estado.eliminar_sesion(SESION_POR_DEFECTO));
        assert!(estado.sesion(SESION_POR_DEFECTO).is_some());
    }

    #[test]
    fn session_count_is_capped() {
        let estado = estado("3");
        assert!(estado.crear_sesion().is_some());
        assert!(estado.crear_sesion().is_some());
        assert!(estado.crear_sesion().is_none());
        assert_eq!(abiertas(&estado), 3);
    }

    #[test]
    fn status_stays_busy_until_last_calculation_ends() {
        let estado = estado("8");
        let primero = estado.iniciar_calculo("Calculando parcela A...");
        let segundo = estado.iniciar_calculo("Calculando parcela B...");

        drop(primero);
        let status = estado.status.lock().unwrap().clone();
        assert!(status.is_busy);
        assert_eq!(status.message, "Calculando parcela B...");

        drop(segundo);
        let status = estado.status.lock().unwrap().clone();
        assert!(!status.is_busy);
        assert_eq!(status.message, MENSAJE_LISTO);
    }
}
