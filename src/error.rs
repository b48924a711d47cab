//! Taxonomía de errores del pipeline de informes compuestos.

use thiserror::Error;

/// Errores de validación: se detectan antes de cualquier llamada de red.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No se seleccionó ninguna parcela.
    #[error("no se seleccionó ninguna parcela")]
    SinParcelas,

    /// Más parcelas de las que admite un informe compuesto.
    #[error("se seleccionaron {cantidad} parcelas; el máximo es {maximo}")]
    DemasiadasParcelas { cantidad: usize, maximo: usize },

    /// La parcela no declara linderos ni vecinos secuenciales.
    #[error("la parcela {smp} no declara linderos ni vecinos secuenciales")]
    SinInformacionDeVecinos { smp: String },

    /// Dos parcelas consecutivas de la selección no son contiguas.
    #[error("las parcelas {anterior} y {actual} no son contiguas")]
    NoContiguas { anterior: String, actual: String },

    /// Falta un campo obligatorio del informe.
    #[error("falta el campo obligatorio '{campo}' en la parcela {smp}")]
    CampoFaltante { smp: String, campo: &'static str },
}

/// Error cloneable que comparten todos los que esperan una misma carga en vuelo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CacheError(pub String);

/// Errores del núcleo y de sus colaboradores externos.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Fallo de transporte contra la API del catastro.
    #[error("error HTTP contra la API del catastro: {0}")]
    Http(#[from] reqwest::Error),

    /// La API respondió con un estado no exitoso.
    #[error("la API del catastro respondió {status}: {message}")]
    Api { status: u16, message: String },

    /// La respuesta no tiene la forma esperada.
    #[error("respuesta inválida de la API del catastro: {0}")]
    Decode(String),

    /// Una petición más nueva reemplazó a esta. Nunca se muestra al usuario.
    #[error("operación cancelada por una petición más reciente")]
    Cancelled,

    /// El guardado falló o la API devolvió `success = false`.
    #[error("no se pudo guardar el informe: {0}")]
    Persistence(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Error {
    /// Los errores de cancelación no se reintentan ni se registran como fallos.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
