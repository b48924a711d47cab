//! Pipeline de informes compuestos de prefactibilidad de parcelas.
//!
//! Valida la contigüidad de hasta tres parcelas, obtiene su cálculo derivado
//! con reintentos acotados, las consolida en un único informe y evita
//! guardados duplicados.

pub mod adyacencia;
pub mod api;
pub mod app_state;
pub mod catastro_client;
pub mod config;
pub mod consolidacion;
pub mod error;
pub mod guardado;
pub mod models;
pub mod numero;
pub mod pipeline;
pub mod reintentos;
pub mod single_flight;

pub use error::{Error, Result, ValidationError};
pub use pipeline::{ServicioInformes, Sesion};
