//! Validación de contigüidad entre las parcelas seleccionadas.
//!
//! Las parcelas se tratan como una cadena ordenada: cada par consecutivo
//! debe ser vecino secuencial (`previous`/`next`) o, en su defecto, lindero
//! lateral. El primer par que falla corta la validación.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::ValidationError;
use crate::models::ParcelReport;

/// Máximo de parcelas que admite un informe compuesto.
pub const MAX_PARCELAS: usize = 3;

/// Relaciones de vecindad restringidas al conjunto candidato.
///
/// Cada arista conserva la dirección en que fue declarada: una parcela puede
/// nombrar a otra sin reciprocidad.
#[derive(Debug, Default)]
pub struct GrafoAdyacencia<'a> {
    secuencial: HashMap<&'a str, HashSet<&'a str>>,
    lateral: HashMap<&'a str, HashSet<&'a str>>,
}

impl<'a> GrafoAdyacencia<'a> {
    /// Construye el grafo descartando identificadores fuera de la selección.
    pub fn construir(parcelas: &'a [ParcelReport]) -> Self {
        let candidatas: HashSet<&str> = parcelas.iter().map(|p| p.smp.as_str()).collect();
        let mut grafo = Self::default();

        for parcela in parcelas {
            let origen = parcela.smp.as_str();

            let secuenciales = [parcela.previous.as_deref(), parcela.next.as_deref()]
                .into_iter()
                .flatten()
                .filter(|smp| candidatas.contains(smp) && *smp != origen);
            grafo.secuencial.entry(origen).or_default().extend(secuenciales);

            let laterales = parcela
                .linderos
                .iter()
                .map(String::as_str)
                .filter(|smp| candidatas.contains(smp) && *smp != origen);
            grafo.lateral.entry(origen).or_default().extend(laterales);
        }

        grafo
    }

    fn declara(mapa: &HashMap<&str, HashSet<&str>>, desde: &str, hacia: &str) -> bool {
        mapa.get(desde).is_some_and(|vecinos| vecinos.contains(hacia))
    }

    /// Vecinos por `previous`/`next`, mirando desde cualquiera de los dos lados.
    pub fn son_secuenciales(&self, a: &str, b: &str) -> bool {
        Self::declara(&self.secuencial, a, b) || Self::declara(&self.secuencial, b, a)
    }

    /// Linderos laterales; basta con que uno de los dos lo declare.
    pub fn son_linderos(&self, a: &str, b: &str) -> bool {
        Self::declara(&self.lateral, a, b) || Self::declara(&self.lateral, b, a)
    }

    pub fn son_contiguas(&self, a: &str, b: &str) -> bool {
        self.son_secuenciales(a, b) || self.son_linderos(a, b)
    }
}

/// Verifica que las parcelas seleccionadas formen una cadena contigua.
pub fn validar_cadena(parcelas: &[ParcelReport]) -> Result<(), ValidationError> {
    match parcelas.len() {
        0 => return Err(ValidationError::SinParcelas),
        1 => return Ok(()),
        n if n > MAX_PARCELAS => {
            return Err(ValidationError::DemasiadasParcelas {
                cantidad: n,
                maximo: MAX_PARCELAS,
            })
        }
        _ => {}
    }

    if let Some(aislada) = parcelas.iter().find(|p| !p.declara_vecinos()) {
        return Err(ValidationError::SinInformacionDeVecinos {
            smp: aislada.smp.clone(),
        });
    }

    let grafo = GrafoAdyacencia::construir(parcelas);

    for par in parcelas.windows(2) {
        let (anterior, actual) = (&par[0].smp, &par[1].smp);
        if grafo.son_secuenciales(anterior, actual) {
            debug!(%anterior, %actual, "parcelas contiguas por secuencia");
            continue;
        }
        if grafo.son_linderos(anterior, actual) {
            debug!(%anterior, %actual, "parcelas contiguas por lindero");
            continue;
        }
        return Err(ValidationError::NoContiguas {
            anterior: anterior.clone(),
            actual: actual.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parcela(smp: &str) -> ParcelReport {
        ParcelReport {
            smp: smp.to_string(),
            ..Default::default()
        }
    }

    fn con_linderos(smp: &str, linderos: &[&str]) -> ParcelReport {
        ParcelReport {
            linderos: linderos.iter().map(|s| s.to_string()).collect(),
            ..parcela(smp)
        }
    }

    #[test]
    fn sequential_chain_is_valid() {
        let a = ParcelReport {
            next: Some("B".into()),
            ..parcela("A")
        };
        let b = ParcelReport {
            previous: Some("A".into()),
            next: Some("C".into()),
            ..parcela("B")
        };
        let c = ParcelReport {
            previous: Some("B".into()),
            ..parcela("C")
        };

        assert_eq!(validar_cadena(&[a, b, c]), Ok(()));
    }

    #[test]
    fn unrelated_parcel_breaks_the_chain() {
        let a = con_linderos("A", &["B"]);
        let b = con_linderos("B", &["A"]);
        let c = con_linderos("C", &["Z"]);

        assert_eq!(
            validar_cadena(&[a, b, c]),
            Err(ValidationError::NoContiguas {
                anterior: "B".into(),
                actual: "C".into(),
            })
        );
    }

    #[test]
    fn first_failing_pair_is_reported() {
        let a = con_linderos("A", &["Z"]);
        let b = con_linderos("B", &["Y"]);
        let c = con_linderos("C", &["X"]);

        let err = validar_cadena(&[a, b, c]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NoContiguas {
                anterior: "A".into(),
                actual: "B".into(),
            }
        );
    }

    #[test]
    fn single_parcel_is_trivially_valid() {
        assert_eq!(validar_cadena(&[parcela("A")]), Ok(()));
    }

    #[test]
    fn parcel_without_neighbor_data_is_rejected() {
        let a = con_linderos("A", &["B"]);
        let b = parcela("B");

        assert_eq!(
            validar_cadena(&[a, b]),
            Err(ValidationError::SinInformacionDeVecinos { smp: "B".into() })
        );
    }

    #[test]
    fn one_sided_lindero_is_accepted() {
        let a = con_linderos("A", &["B"]);
        let b = con_linderos("B", &["Q"]);

        assert_eq!(validar_cadena(&[a, b]), Ok(()));
    }

    #[test]
    fn size_limits() {
        assert_eq!(validar_cadena(&[]), Err(ValidationError::SinParcelas));
        let cuatro: Vec<_> = ["A", "B", "C", "D"]
            .iter()
            .map(|s| con_linderos(s, &["A", "B", "C", "D"]))
            .collect();
        assert_eq!(
            validar_cadena(&cuatro),
            Err(ValidationError::DemasiadasParcelas {
                cantidad: 4,
                maximo: 3
            })
        );
    }

    #[test]
    fn graph_drops_identifiers_outside_selection() {
        let parcelas = vec![con_linderos("A", &["B", "Z"]), con_linderos("B", &["W"])];
        let grafo = GrafoAdyacencia::construir(&parcelas);

        assert!(grafo.son_linderos("A", "B"));
        assert!(!grafo.son_contiguas("A", "Z"));
        assert!(!grafo.son_secuenciales("A", "B"));
    }
}
