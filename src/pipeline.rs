//! Pipeline de informes compuestos.
//!
//! Flujo:
//!   1. Cada dirección seleccionada se resuelve a un informe de parcela.
//!   2. Se valida que las parcelas formen una cadena contigua.
//!   3. Se obtiene el cálculo derivado de cada parcela con reintentos.
//!   4. Se consolidan los informes en uno solo.
//!   5. La guardia de guardado decide si el resultado se persiste.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catastro_client::{CatastroApi, OpcionesConsulta, ResolucionDireccion};
use crate::consolidacion;
use crate::error::{CacheError, Error, Result, ValidationError};
use crate::guardado::{self, Rechazo, SaveGuard};
use crate::models::{ConsolidatedReport, ParcelReport, PrecioAdicional, TipoInforme};
use crate::reintentos::{self, BackoffPolicy, Desenlace};
use crate::single_flight::SingleFlightCache;

/// Clave de la lista de historial en la caché de listas.
pub const CLAVE_HISTORIAL: &str = "historial";
/// Clave de la lista de precios de adicionales.
pub const CLAVE_PRECIOS: &str = "precios";

/// Contenido de la caché de listas.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Lista {
    Historial(Vec<String>),
    Precios(Vec<PrecioAdicional>),
}

/// Estado de una sesión de usuario.
#[derive(Default)]
pub struct Sesion {
    calculo_en_curso: Mutex<Option<CancellationToken>>,
    generacion: AtomicU64,
    informe_de_trabajo: Mutex<Option<ParcelReport>>,
    guardia: SaveGuard,
}

impl Sesion {
    pub fn new() -> Self {
        Self::default()
    }

    fn en_curso(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.calculo_en_curso.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn trabajo(&self) -> MutexGuard<'_, Option<ParcelReport>> {
        self.informe_de_trabajo.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancela el cálculo anterior y abre uno nuevo.
    fn iniciar_calculo(&self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let mut en_curso = self.en_curso();
        if let Some(anterior) = en_curso.replace(token.clone()) {
            anterior.cancel();
        }
        let generacion = self.generacion.fetch_add(1, Ordering::SeqCst) + 1;
        (generacion, token)
    }

    fn es_actual(&self, generacion: u64) -> bool {
        self.generacion.load(Ordering::SeqCst) == generacion
    }

    pub fn informe_de_trabajo(&self) -> Option<ParcelReport> {
        self.trabajo().clone()
    }

    pub fn fijar_informe_de_trabajo(&self, informe: ParcelReport) {
        *self.trabajo() = Some(informe);
    }

    pub fn calculo_en_curso(&self) -> bool {
        self.en_curso().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    pub fn guardia(&self) -> &SaveGuard {
        &self.guardia
    }

    /// Descarta el informe de trabajo, cancela cálculos y olvida guardados.
    pub fn reset(&self) {
        if let Some(token) = self.en_curso().take() {
            token.cancel();
        }
        self.generacion.fetch_add(1, Ordering::SeqCst);
        *self.trabajo() = None;
        self.guardia.reset();
    }
}

/// Resultado de pedir el cálculo derivado de un informe.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultadoCalculo {
    Calculado(ParcelReport),
    /// Se agotaron los intentos; se devuelve el informe original con aviso.
    SinCalculo { informe: ParcelReport, aviso: String },
    /// Una petición más reciente reemplazó a esta.
    Cancelado,
}

impl ResultadoCalculo {
    /// Informe que el llamador debe mostrar, salvo si fue cancelado.
    pub fn informe(&self) -> Option<&ParcelReport> {
        match self {
            ResultadoCalculo::Calculado(informe) => Some(informe),
            ResultadoCalculo::SinCalculo { informe, .. } => Some(informe),
            ResultadoCalculo::Cancelado => None,
        }
    }
}

/// Resultado de resolver una dirección.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolucion {
    Informe(Box<ParcelReport>),
    EnProceso,
    /// Ya existe un informe para la dirección y el tipo; requiere confirmación.
    Conflicto { informe_id: String },
}

/// Resultado de un intento de guardado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultadoGuardado {
    Guardado { id: String },
    Omitido(Rechazo),
}

/// Servicio de informes compuestos.
pub struct ServicioInformes {
    api: Arc<dyn CatastroApi>,
    backoff: BackoffPolicy,
    ttl_compartidos: Duration,
    compartidos: SingleFlightCache<ParcelReport>,
    listas: SingleFlightCache<Lista>,
}

impl ServicioInformes {
    pub fn new(api: Arc<dyn CatastroApi>, backoff: BackoffPolicy, ttl_compartidos: Duration) -> Self {
        Self {
            api,
            backoff,
            ttl_compartidos,
            compartidos: SingleFlightCache::new(),
            listas: SingleFlightCache::new(),
        }
    }

    pub fn validate_and_consolidate(
        &self,
        seleccion: &[ParcelReport],
    ) -> std::result::Result<ConsolidatedReport, ValidationError> {
        consolidacion::consolidar(seleccion)
    }

    /// Resuelve una dirección. Si ya existe un informe del mismo tipo y el
    /// usuario no lo confirmó, devuelve [`Resolucion::Conflicto`].
    pub async fn resolve_address(
        &self,
        direccion: &str,
        opciones: OpcionesConsulta,
        confirmado: bool,
    ) -> Result<Resolucion> {
        if !confirmado {
            if let Some(informe_id) = self.api.informe_existente(direccion, opciones.tipo()).await? {
                info!(direccion, informe_id = %informe_id, "ya existe un informe para la dirección");
                return Ok(Resolucion::Conflicto { informe_id });
            }
        }

        match self.api.resolver_direccion(direccion, opciones).await? {
            ResolucionDireccion::Informe(informe) => Ok(Resolucion::Informe(informe)),
            ResolucionDireccion::EnProceso => {
                debug!(direccion, "la dirección ya se está procesando");
                Ok(Resolucion::EnProceso)
            }
        }
    }

    /// Obtiene el cálculo derivado con reintentos. Nunca falla por agotamiento:
    /// en ese caso devuelve el informe original.
    ///
    /// Iniciar un cálculo cancela el anterior de la misma sesión, y sólo el
    /// más reciente actualiza el informe de trabajo.
    pub async fn retrieve_calculation(&self, sesion: &Sesion, informe: ParcelReport) -> ResultadoCalculo {
        let (generacion, cancel) = sesion.iniciar_calculo();
        let api = Arc::clone(&self.api);
        let base = &informe;

        let desenlace = reintentos::retrieve(
            &informe.smp,
            &self.backoff,
            || {
                let api = Arc::clone(&api);
                async move { api.calcular(base).await }
            },
            reintentos::calculo_valido,
            &cancel,
        )
        .await;

        let resultado = match desenlace {
            Desenlace::Valido(respuesta) => ResultadoCalculo::Calculado(respuesta.aplicar(&informe)),
            Desenlace::Agotado => ResultadoCalculo::SinCalculo {
                aviso: format!(
                    "No se pudo obtener el cálculo de la parcela {} tras {} intentos; se muestra el informe sin calcular.",
                    informe.smp, self.backoff.max_attempts
                ),
                informe,
            },
            Desenlace::Cancelado => return ResultadoCalculo::Cancelado,
        };

        // Comprobar y aplicar bajo el mismo cerrojo que usa `iniciar_calculo`.
        let mut en_curso = sesion.en_curso();
        if !sesion.es_actual(generacion) || cancel.is_cancelled() {
            debug!("resultado de cálculo obsoleto descartado");
            return ResultadoCalculo::Cancelado;
        }
        if let Some(informe) = resultado.informe() {
            sesion.fijar_informe_de_trabajo(informe.clone());
        }
        *en_curso = None;
        resultado
    }

    /// Informe compartido por token, con coalescencia de cargas casi simultáneas.
    pub async fn get_or_fetch_shared(&self, token: &str) -> std::result::Result<Arc<ParcelReport>, CacheError> {
        let api = Arc::clone(&self.api);
        let token_owned = token.to_string();
        self.compartidos
            .get_or_fetch(token, Some(self.ttl_compartidos), move || async move {
                api.informe_compartido(&token_owned).await
            })
            .await
    }

    /// Listas sin expiración; se invalidan explícitamente al mutar.
    pub async fn get_or_fetch_list(&self, key: &str) -> std::result::Result<Arc<Lista>, CacheError> {
        let api = Arc::clone(&self.api);
        match key {
            CLAVE_HISTORIAL => {
                self.listas
                    .get_or_fetch(key, None, move || async move {
                        api.historial().await.map(Lista::Historial)
                    })
                    .await
            }
            CLAVE_PRECIOS => {
                self.listas
                    .get_or_fetch(key, None, move || async move {
                        api.precios_adicionales().await.map(Lista::Precios)
                    })
                    .await
            }
            otra => Err(CacheError(format!("lista desconocida: {otra}"))),
        }
    }

    /// Descarta una lista cacheada; la próxima lectura vuelve a pedirla.
    pub fn invalidate_list(&self, key: &str) {
        debug!(key, "lista invalidada");
        self.listas.invalidate(key);
    }

    pub async fn append_history(&self, direccion: &str) -> Result<()> {
        self.api.agregar_historial(direccion).await?;
        self.invalidate_list(CLAVE_HISTORIAL);
        Ok(())
    }

    pub fn should_save(&self, sesion: &Sesion, informe: &ParcelReport, tipo: TipoInforme) -> bool {
        sesion.guardia().should_save(informe, tipo)
    }

    pub fn record_save(&self, sesion: &Sesion, informe: &ParcelReport, tipo: TipoInforme, id: &str) {
        sesion.guardia().record_save(informe, tipo, id);
    }

    /// Guarda el informe si la guardia lo permite. La llamada de persistencia
    /// ocurre como mucho una vez por invocación.
    pub async fn save(&self, sesion: &Sesion, informe: &ParcelReport, tipo: TipoInforme) -> Result<ResultadoGuardado> {
        if let Err(rechazo) = sesion.guardia().begin(informe, tipo) {
            debug!(smp = %informe.smp, ?rechazo, "guardado omitido");
            return Ok(ResultadoGuardado::Omitido(rechazo));
        }

        let huella = guardado::huella(informe, tipo);
        let respuesta = match self.api.guardar(informe, tipo, &huella).await {
            Ok(respuesta) => respuesta,
            Err(err) => {
                sesion.guardia().abort();
                warn!(smp = %informe.smp, error = %err, "fallo al guardar el informe");
                return Err(Error::Persistence(err.to_string()));
            }
        };

        match (respuesta.success, respuesta.id) {
            (true, Some(id)) => {
                self.record_save(sesion, informe, tipo, &id);
                Ok(ResultadoGuardado::Guardado { id })
            }
            (_, _) => {
                sesion.guardia().abort();
                let motivo = respuesta
                    .message
                    .unwrap_or_else(|| "la API no confirmó el guardado".to_string());
                warn!(smp = %informe.smp, %motivo, "guardado rechazado por la API");
                Err(Error::Persistence(motivo))
            }
        }
    }

    /// Vacía las cachés del servicio.
    pub fn clear_caches(&self) {
        self.compartidos.clear();
        self.listas.clear();
    }
}
