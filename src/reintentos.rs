//! Reintentos acotados con backoff exponencial y jitter.
//!
//! Se usa para consultar el endpoint de cálculo hasta obtener una respuesta
//! válida. Agotar los intentos no es un error: el llamador sigue con el
//! informe sin calcular.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::models::RespuestaCalculo;

/// Parámetros del backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(10_000),
            jitter_max: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Espera tras el intento `attempt` (base 0): `min(base * 2^attempt, cap)`
    /// más un jitter uniforme en `[0, jitter_max)`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let exponencial = self.base.saturating_mul(factor).min(self.cap);
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..jitter_ms)
        };
        exponencial + Duration::from_millis(jitter)
    }
}

/// Desenlace de una ejecución del motor de reintentos.
#[derive(Debug)]
pub enum Desenlace<T> {
    Valido(T),
    Agotado,
    Cancelado,
}

impl<T> Desenlace<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Desenlace::Valido(valor) => Some(valor),
            Desenlace::Agotado | Desenlace::Cancelado => None,
        }
    }
}

/// Ejecuta `fetch` hasta que `is_valid` acepte la respuesta, se agoten los
/// intentos o se cancele `cancel`.
///
/// La cancelación se observa antes de cada intento, durante la petición y
/// durante la espera; nunca se reintenta ni se registra como fallo.
pub async fn retrieve<T, F, Fut, V>(
    key: &str,
    policy: &BackoffPolicy,
    mut fetch: F,
    is_valid: V,
    cancel: &CancellationToken,
) -> Desenlace<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    V: Fn(&T) -> bool,
{
    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Desenlace::Cancelado;
        }

        let resultado = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Desenlace::Cancelado,
            resultado = fetch() => resultado,
        };

        match resultado {
            Ok(respuesta) if is_valid(&respuesta) => {
                debug!(key, intento = attempt + 1, "respuesta válida");
                return Desenlace::Valido(respuesta);
            }
            Ok(_) => {
                debug!(key, intento = attempt + 1, "respuesta aún sin valores, se reintenta");
            }
            Err(err) if err.is_cancellation() => return Desenlace::Cancelado,
            Err(err) => {
                debug!(key, intento = attempt + 1, error = %err, "fallo transitorio");
            }
        }

        if attempt + 1 >= policy.max_attempts {
            break;
        }

        let espera = policy.delay(attempt, &mut rand::thread_rng());
        debug!(key, espera_ms = espera.as_millis() as u64, "esperando antes de reintentar");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Desenlace::Cancelado,
            _ = tokio::time::sleep(espera) => {}
        }
    }

    warn!(key, intentos = policy.max_attempts, "cálculo sin resultado válido tras agotar los intentos");
    Desenlace::Agotado
}

/// Una respuesta de cálculo es válida si el cálculo anidado trae algún campo
/// conocido distinto de cero, o si algún campo crítico de primer nivel lo es.
pub fn calculo_valido(respuesta: &RespuestaCalculo) -> bool {
    let calculo_ok = respuesta.calculo.as_ref().is_some_and(|c| c.tiene_valor());
    let critico_ok = respuesta
        .campos_criticos()
        .iter()
        .flatten()
        .any(|campo| !campo.es_cero());
    calculo_ok || critico_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Calculo;
    use crate::numero::NumeroLocal;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        for (attempt, base_ms) in [(0, 1000), (1, 2000), (2, 4000), (3, 8000), (4, 10_000), (9, 10_000)] {
            let espera = policy.delay(attempt, &mut rng).as_millis() as u64;
            assert!(espera >= base_ms, "attempt {attempt}: {espera}");
            assert!(espera < base_ms + 1000, "attempt {attempt}: {espera}");
        }
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = BackoffPolicy {
            jitter_max: Duration::ZERO,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(1, &mut rng), Duration::from_millis(2000));
        assert_eq!(policy.delay(40, &mut rng), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let llamadas = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let inicio = Instant::now();

        let contador = Arc::clone(&llamadas);
        let desenlace = retrieve(
            "044-076-004",
            &BackoffPolicy::default(),
            move || {
                let n = contador.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Api {
                            status: 503,
                            message: "ocupado".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
            &cancel,
        )
        .await;

        let transcurrido = inicio.elapsed();
        assert!(matches!(desenlace, Desenlace::Valido(3)));
        assert_eq!(llamadas.load(Ordering::SeqCst), 3);
        assert!(transcurrido >= Duration::from_millis(3000), "{transcurrido:?}");
        assert!(transcurrido < Duration::from_millis(5000), "{transcurrido:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zeroed_payload_exhausts_after_three_attempts() {
        let llamadas = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let contador = Arc::clone(&llamadas);
        let desenlace = retrieve(
            "k",
            &BackoffPolicy::default(),
            move || {
                contador.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok(RespuestaCalculo {
                        calculo: Some(Calculo {
                            capacidad_constructiva: Some(NumeroLocal::from("0,00")),
                            ..Default::default()
                        }),
                        plusvalia_total: Some(NumeroLocal::from(0.0)),
                        ..Default::default()
                    })
                }
            },
            calculo_valido,
            &cancel,
        )
        .await;

        assert!(matches!(desenlace, Desenlace::Agotado));
        assert_eq!(llamadas.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_error_stops_immediately() {
        let llamadas = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let contador = Arc::clone(&llamadas);
        let desenlace = retrieve(
            "k",
            &BackoffPolicy::default(),
            move || {
                contador.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(Error::Cancelled) }
            },
            |_| true,
            &cancel,
        )
        .await;

        assert!(matches!(desenlace, Desenlace::Cancelado));
        assert_eq!(llamadas.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_prevents_next_attempt() {
        let llamadas = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let disparador = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            disparador.cancel();
        });

        let contador = Arc::clone(&llamadas);
        let desenlace = retrieve(
            "k",
            &BackoffPolicy::default(),
            move || {
                contador.fetch_add(1, Ordering::SeqCst);
                async { Ok(0u32) }
            },
            |n| *n > 0,
            &cancel,
        )
        .await;

        assert!(matches!(desenlace, Desenlace::Cancelado));
        assert_eq!(llamadas.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_fetch() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let desenlace = retrieve(
            "k",
            &BackoffPolicy::default(),
            || async { Ok(1u32) },
            |_| true,
            &cancel,
        )
        .await;

        assert!(desenlace.into_option().is_none());
    }

    #[test]
    fn validity_predicate() {
        let vacia = RespuestaCalculo::default();
        assert!(!calculo_valido(&vacia));

        let con_calculo = RespuestaCalculo {
            calculo: Some(Calculo {
                volumen_edificable: Some(NumeroLocal::from("1.250,3")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(calculo_valido(&con_calculo));

        let solo_critico = RespuestaCalculo {
            sup_max_edificable: Some(NumeroLocal::from(420.0)),
            ..Default::default()
        };
        assert!(calculo_valido(&solo_critico));
    }
}
