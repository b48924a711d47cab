//! Lectura y escritura de números con formato local (coma o punto decimal).

use serde::{Deserialize, Serialize};

/// Valor numérico tal como llega de la API: número JSON o cadena local
/// (`"100,5"`, `"1.234,56"`, `"25.25"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumeroLocal {
    Numero(f64),
    Texto(String),
}

impl NumeroLocal {
    /// `None` si el valor no es un número.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NumeroLocal::Numero(n) if n.is_finite() => Some(*n),
            NumeroLocal::Numero(_) => None,
            NumeroLocal::Texto(s) => parse_locale(s),
        }
    }

    pub fn es_cero(&self) -> bool {
        self.as_f64().map_or(true, |n| n == 0.0)
    }
}

impl From<f64> for NumeroLocal {
    fn from(n: f64) -> Self {
        NumeroLocal::Numero(n)
    }
}

impl From<&str> for NumeroLocal {
    fn from(s: &str) -> Self {
        NumeroLocal::Texto(s.to_string())
    }
}

/// Interpreta una cadena numérica local.
///
/// Si hay una coma, es el separador decimal y los puntos son separadores de
/// miles. Sin coma, el punto es el separador decimal.
pub fn parse_locale(raw: &str) -> Option<f64> {
    let limpio = raw
        .trim()
        .trim_end_matches("m²")
        .trim_end_matches("m2")
        .trim();
    let limpio: String = limpio.chars().filter(|c| !c.is_whitespace()).collect();
    if limpio.is_empty() {
        return None;
    }

    let normalizado = if limpio.contains(',') {
        limpio.replace('.', "").replace(',', ".")
    } else {
        limpio
    };

    normalizado
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

/// Formato de presentación del sistema: coma decimal, hasta dos decimales,
/// sin ceros finales.
pub fn format_locale(valor: f64) -> String {
    let redondeado = (valor * 100.0).round() / 100.0;
    let texto = format!("{redondeado:.2}");
    let texto = texto.trim_end_matches('0').trim_end_matches('.');
    let texto = if texto == "-0" { "0" } else { texto };
    texto.replace('.', ",")
}
