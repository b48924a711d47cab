//! Caché con coalescencia de peticiones concurrentes por clave.
//!
//! Para una misma clave hay como mucho una carga en vuelo; todos los que
//! esperan reciben el mismo `Arc` resultante. Los fallos no se guardan.
//!
//! Cada carga lleva un número de turno. Al terminar sólo escribe en la caché
//! si sigue siendo la carga registrada para su clave, así que `invalidate` y
//! `clear` descartan también lo que ya estaba en vuelo.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;

type CargaCompartida<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

struct Entrada<V> {
    valor: Arc<V>,
    expira: Option<Instant>,
}

impl<V> Entrada<V> {
    fn vigente(&self, ahora: Instant) -> bool {
        self.expira.map_or(true, |expira| ahora < expira)
    }
}

struct Estado<V> {
    resultados: HashMap<String, Entrada<V>>,
    en_vuelo: HashMap<String, (u64, CargaCompartida<V>)>,
    siguiente_turno: u64,
}

/// Caché de resultados con expiración opcional y coalescencia de cargas.
pub struct SingleFlightCache<V> {
    estado: Arc<Mutex<Estado<V>>>,
}

impl<V> Default for SingleFlightCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SingleFlightCache<V> {
    pub fn new() -> Self {
        Self {
            estado: Arc::new(Mutex::new(Estado {
                resultados: HashMap::new(),
                en_vuelo: HashMap::new(),
                siguiente_turno: 0,
            })),
        }
    }

    fn bloquear(&self) -> MutexGuard<'_, Estado<V>> {
        // Ninguna sección crítica puede dejar el estado a medias.
        self.estado.lock().unwrap_or_else(|envenenado| envenenado.into_inner())
    }

    /// Descarta el resultado guardado para `key` y la carga en vuelo, si la
    /// hay. Esa carga termina igual pero su valor ya no se guarda.
    pub fn invalidate(&self, key: &str) {
        let mut estado = self.bloquear();
        estado.resultados.remove(key);
        if estado.en_vuelo.remove(key).is_some() {
            debug!(key, "caché: carga en vuelo invalidada");
        }
    }

    /// Vacía la caché. Las cargas en vuelo terminan, pero ya no la repueblan.
    pub fn clear(&self) {
        let mut estado = self.bloquear();
        estado.resultados.clear();
        estado.en_vuelo.clear();
    }

    pub fn len(&self) -> usize {
        let ahora = Instant::now();
        self.bloquear()
            .resultados
            .values()
            .filter(|entrada| entrada.vigente(ahora))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> SingleFlightCache<V>
where
    V: Send + Sync + 'static,
{
    /// Devuelve el valor vigente para `key`, se une a la carga en vuelo o
    /// inicia una nueva. `ttl = None` significa sin expiración.
    ///
    /// La carga corre en su propia tarea: si todos los llamadores dejan de
    /// esperar, igual termina y deja el resultado en la caché.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        let carga = {
            let mut estado = self.bloquear();

            if let Some(entrada) = estado.resultados.get(key) {
                if entrada.vigente(Instant::now()) {
                    debug!(key, "caché: acierto");
                    return Ok(Arc::clone(&entrada.valor));
                }
                estado.resultados.remove(key);
            }

            if let Some((_, pendiente)) = estado.en_vuelo.get(key) {
                debug!(key, "caché: uniéndose a carga en vuelo");
                pendiente.clone()
            } else {
                debug!(key, "caché: iniciando carga");
                estado.siguiente_turno += 1;
                let turno = estado.siguiente_turno;
                let carga = self.lanzar(key, ttl, turno, fetch());
                estado.en_vuelo.insert(key.to_string(), (turno, carga.clone()));
                carga
            }
        };

        carga.await
    }

    fn lanzar<Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        turno: u64,
        fetch: Fut,
    ) -> CargaCompartida<V>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        let estado = Arc::clone(&self.estado);
        let clave = key.to_string();

        // El resultado del fetch se convierte antes de cruzar la tarea: `E`
        // no tiene por qué ser `Send`.
        let fetch = fetch.map(|r| r.map(Arc::new).map_err(|e| CacheError(e.to_string())));

        let tarea = tokio::spawn(async move {
            let resultado = fetch.await;
            let mut estado = estado.lock().unwrap_or_else(|e| e.into_inner());
            let vigente = matches!(estado.en_vuelo.get(&clave), Some((t, _)) if *t == turno);
            if vigente {
                estado.en_vuelo.remove(&clave);
                if let Ok(valor) = &resultado {
                    estado.resultados.insert(
                        clave,
                        Entrada {
                            valor: Arc::clone(valor),
                            expira: ttl.map(|ttl| Instant::now() + ttl),
                        },
                    );
                }
            }
            resultado
        });

        async move {
            tarea
                .await
                .unwrap_or_else(|e| Err(CacheError(format!("la carga terminó de forma anómala: {e}"))))
        }
        .boxed()
        .shared()
    }
}
