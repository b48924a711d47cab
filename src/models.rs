//! Modelos de dominio: informe de parcela, cálculo derivado e informe consolidado.
//!
//! Todos los campos que la API puede omitir son `Option`. La regla
//! "ausente equivale a cero" vive en [`defaults`] y en ningún otro sitio.

use serde::{Deserialize, Serialize};

use crate::numero::NumeroLocal;

/// Tabla central de valores por defecto para campos ausentes.
pub mod defaults {
    use crate::numero::NumeroLocal;

    pub const NUMERO_AUSENTE: f64 = 0.0;

    pub fn numero(valor: Option<f64>) -> f64 {
        valor.unwrap_or(NUMERO_AUSENTE)
    }

    pub fn numero_local(valor: Option<&NumeroLocal>) -> f64 {
        valor.and_then(NumeroLocal::as_f64).unwrap_or(NUMERO_AUSENTE)
    }
}

/// Tipo de informe solicitado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipoInforme {
    #[default]
    Basico,
    Completo,
    Compuesto,
}

impl TipoInforme {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipoInforme::Basico => "basico",
            TipoInforme::Completo => "completo",
            TipoInforme::Compuesto => "compuesto",
        }
    }
}

/// Dirección normalizada por el servicio de geocodificación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direccion {
    pub calle: String,
    pub altura: Option<u32>,
    #[serde(default)]
    pub direccion_normalizada: String,
}

impl Direccion {
    /// Forma canónica usada para comparar y para las huellas de guardado.
    pub fn clave(&self) -> String {
        let base = if self.direccion_normalizada.trim().is_empty() {
            match self.altura {
                Some(altura) => format!("{} {}", self.calle, altura),
                None => self.calle.clone(),
            }
        } else {
            self.direccion_normalizada.clone()
        };
        base.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatosCatastrales {
    pub superficie: Option<NumeroLocal>,
    pub frente: Option<NumeroLocal>,
    pub fondo: Option<NumeroLocal>,
}

/// Componentes de plusvalía.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plusvalia {
    pub plusvalia_em: Option<f64>,
    pub plusvalia_pl: Option<f64>,
    pub plusvalia_sl: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Edificabilidad {
    pub sup_edificable_planta: Option<f64>,
    pub sup_max_edificable: Option<f64>,
    pub altura_max: Option<f64>,
    #[serde(default)]
    pub plusvalia: Plusvalia,
}

/// Elemento GeoJSON de la geometría de la parcela.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "Feature::tipo_por_defecto")]
    pub tipo: String,
    pub geometry: serde_json::Value,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    fn tipo_por_defecto() -> String {
        "Feature".to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometria {
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordenadas {
    pub lat: f64,
    pub lng: f64,
}

/// Resultado del endpoint de cálculo derivado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calculo {
    pub capacidad_constructiva: Option<NumeroLocal>,
    pub superficie_vendible: Option<NumeroLocal>,
    pub volumen_edificable: Option<NumeroLocal>,
    pub cantidad_pisos: Option<NumeroLocal>,
    pub incidencia_uva: Option<NumeroLocal>,
    pub plusvalia_total: Option<NumeroLocal>,
}

impl Calculo {
    /// Campos numéricos que demuestran que el cálculo ya se resolvió.
    pub fn campos_conocidos(&self) -> [Option<&NumeroLocal>; 6] {
        [
            self.capacidad_constructiva.as_ref(),
            self.superficie_vendible.as_ref(),
            self.volumen_edificable.as_ref(),
            self.cantidad_pisos.as_ref(),
            self.incidencia_uva.as_ref(),
            self.plusvalia_total.as_ref(),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.campos_conocidos().iter().all(Option::is_none)
    }

    pub fn tiene_valor(&self) -> bool {
        self.campos_conocidos()
            .iter()
            .flatten()
            .any(|campo| !campo.es_cero())
    }
}

/// Informe de una parcela resuelto por la API del catastro.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParcelReport {
    /// Identificador asignado por la API al guardar.
    #[serde(default)]
    pub id: Option<String>,
    pub smp: String,
    #[serde(default)]
    pub direcciones: Vec<Direccion>,
    #[serde(default)]
    pub datos_catastrales: DatosCatastrales,
    #[serde(default)]
    pub edificabilidad: Edificabilidad,
    /// Linderos declarados (vecinos laterales).
    #[serde(default)]
    pub linderos: Vec<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub geometria: Geometria,
    #[serde(default)]
    pub coordenadas: Option<Coordenadas>,
    #[serde(default)]
    pub calculo: Option<Calculo>,
    #[serde(default)]
    pub tipo: TipoInforme,
}

impl ParcelReport {
    pub fn direccion_principal(&self) -> Option<&Direccion> {
        self.direcciones.first()
    }

    /// Verdadero si la parcela declara algún vecino, lateral o secuencial.
    pub fn declara_vecinos(&self) -> bool {
        !self.linderos.is_empty() || self.previous.is_some() || self.next.is_some()
    }
}

/// Informe resultante de fusionar 1 a 3 parcelas contiguas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    #[serde(flatten)]
    pub informe: ParcelReport,
    /// SMP de cada parcela componente, en el orden de la selección.
    pub componentes: Vec<String>,
}

/// Servicio adicional con su precio, tal como lo publica la API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecioAdicional {
    pub id: String,
    pub nombre: String,
    pub precio: NumeroLocal,
}

/// Respuesta parcial del endpoint de cálculo, aplicada sobre el informe original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RespuestaCalculo {
    #[serde(default)]
    pub calculo: Option<Calculo>,
    pub sup_max_edificable: Option<NumeroLocal>,
    pub sup_edificable_planta: Option<NumeroLocal>,
    pub plusvalia_total: Option<NumeroLocal>,
}

impl RespuestaCalculo {
    /// Campos críticos de primer nivel.
    pub fn campos_criticos(&self) -> [Option<&NumeroLocal>; 3] {
        [
            self.sup_max_edificable.as_ref(),
            self.sup_edificable_planta.as_ref(),
            self.plusvalia_total.as_ref(),
        ]
    }

    /// Vuelca la respuesta sobre una copia del informe.
    pub fn aplicar(&self, informe: &ParcelReport) -> ParcelReport {
        let mut resultado = informe.clone();
        if let Some(calculo) = &self.calculo {
            resultado.calculo = Some(calculo.clone());
        }
        if let Some(valor) = self.sup_max_edificable.as_ref().and_then(NumeroLocal::as_f64) {
            resultado.edificabilidad.sup_max_edificable = Some(valor);
        }
        if let Some(valor) = self
            .sup_edificable_planta
            .as_ref()
            .and_then(NumeroLocal::as_f64)
        {
            resultado.edificabilidad.sup_edificable_planta = Some(valor);
        }
        if let Some(total) = &self.plusvalia_total {
            let calculo = resultado.calculo.get_or_insert_with(Calculo::default);
            if calculo.plusvalia_total.is_none() {
                calculo.plusvalia_total = Some(total.clone());
            }
        }
        resultado
    }
}
