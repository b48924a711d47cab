//! Guardia de guardado: decide si un informe terminado debe persistirse.
//!
//! Evita guardados duplicados (y el consumo duplicado de créditos que
//! implican) comparando la huella del informe con la del último guardado
//! exitoso de la sesión. La guardia no hace I/O.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::models::{ParcelReport, TipoInforme};

/// Huella de contenido: parcela(s) + dirección principal normalizada + tipo.
pub fn huella(informe: &ParcelReport, tipo: TipoInforme) -> String {
    let direccion = informe
        .direccion_principal()
        .map(|d| d.clave())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(informe.smp.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(direccion.as_bytes());
    hasher.update([0u8]);
    hasher.update(tipo.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Comprueba los campos sin los cuales un informe no se puede guardar.
pub fn campos_requeridos(informe: &ParcelReport) -> Result<(), ValidationError> {
    let falta = |campo| ValidationError::CampoFaltante {
        smp: informe.smp.clone(),
        campo,
    };

    if informe.smp.trim().is_empty() {
        return Err(falta("smp"));
    }
    if informe.direcciones.is_empty() {
        return Err(falta("direcciones"));
    }
    if informe.datos_catastrales.superficie.is_none() {
        return Err(falta("superficie"));
    }
    match &informe.calculo {
        Some(calculo) if !calculo.is_empty() => Ok(()),
        _ => Err(falta("calculo")),
    }
}

/// Memoria de guardados de una sesión.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveGuardState {
    pub en_vuelo: bool,
    pub ultima_huella: Option<String>,
    pub ultimo_id: Option<String>,
    pub guardado_en: Option<DateTime<Utc>>,
}

/// Motivo por el que no se permite un guardado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rechazo {
    EnVuelo,
    Incompleto(ValidationError),
    Duplicado,
}

/// Guardia de una sesión. Encapsula el estado para poder crear instancias
/// aisladas.
#[derive(Debug, Default)]
pub struct SaveGuard {
    estado: Mutex<SaveGuardState>,
}

impl SaveGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn bloquear(&self) -> MutexGuard<'_, SaveGuardState> {
        self.estado.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SaveGuardState {
        self.bloquear().clone()
    }

    pub fn should_save(&self, informe: &ParcelReport, tipo: TipoInforme) -> bool {
        self.evaluar(&self.bloquear(), informe, tipo).is_ok()
    }

    fn evaluar(
        &self,
        estado: &SaveGuardState,
        informe: &ParcelReport,
        tipo: TipoInforme,
    ) -> Result<(), Rechazo> {
        if estado.en_vuelo {
            return Err(Rechazo::EnVuelo);
        }
        campos_requeridos(informe).map_err(Rechazo::Incompleto)?;

        let huella_nueva = huella(informe, tipo);
        let huella_distinta = estado.ultima_huella.as_deref() != Some(huella_nueva.as_str());
        // Sólo cuenta si el informe trae identificador propio.
        let id_distinto = informe
            .id
            .as_deref()
            .is_some_and(|id| estado.ultimo_id.as_deref() != Some(id));

        if huella_distinta || id_distinto {
            Ok(())
        } else {
            Err(Rechazo::Duplicado)
        }
    }

    /// Evalúa y, si procede, marca el guardado como en vuelo en un solo paso.
    pub fn begin(&self, informe: &ParcelReport, tipo: TipoInforme) -> Result<(), Rechazo> {
        let mut estado = self.bloquear();
        self.evaluar(&estado, informe, tipo)?;
        estado.en_vuelo = true;
        Ok(())
    }

    /// Cierra un guardado fallido sin tocar la huella registrada.
    pub fn abort(&self) {
        self.bloquear().en_vuelo = false;
    }

    /// Registra un guardado exitoso.
    pub fn record_save(&self, informe: &ParcelReport, tipo: TipoInforme, id_guardado: &str) {
        let mut estado = self.bloquear();
        estado.en_vuelo = false;
        estado.ultima_huella = Some(huella(informe, tipo));
        estado.ultimo_id = Some(id_guardado.to_string());
        estado.guardado_en = Some(Utc::now());
        info!(smp = %informe.smp, id = id_guardado, "guardado registrado");
    }

    pub fn reset(&self) {
        debug!("estado de guardado reiniciado");
        *self.bloquear() = SaveGuardState::default();
    }
}
