//! Consolidación de varias parcelas contiguas en un único informe.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::adyacencia;
use crate::error::ValidationError;
use crate::models::{defaults, ConsolidatedReport, Coordenadas, ParcelReport};
use crate::numero::{format_locale, NumeroLocal};

/// Fusiona las parcelas en un informe consolidado.
///
/// La cadena se vuelve a validar aquí aunque el llamador ya lo haya hecho:
/// nunca se agrega un conjunto que no sea contiguo.
pub fn consolidar(parcelas: &[ParcelReport]) -> Result<ConsolidatedReport, ValidationError> {
    adyacencia::validar_cadena(parcelas)?;

    let componentes: Vec<String> = parcelas.iter().map(|p| p.smp.clone()).collect();
    let (primera, resto) = parcelas.split_first().ok_or(ValidationError::SinParcelas)?;

    if resto.is_empty() {
        return Ok(ConsolidatedReport {
            informe: primera.clone(),
            componentes,
        });
    }

    let mut informe = primera.clone();

    let superficie = sumar_locales(parcelas, "superficie", |p| {
        p.datos_catastrales.superficie.as_ref()
    });
    let frente = sumar_locales(parcelas, "frente", |p| p.datos_catastrales.frente.as_ref());
    informe.datos_catastrales.superficie = Some(NumeroLocal::Texto(format_locale(superficie)));
    informe.datos_catastrales.frente = Some(NumeroLocal::Texto(format_locale(frente)));

    informe.smp = componentes.join(", ");

    let edif = &mut informe.edificabilidad;
    edif.sup_edificable_planta = Some(sumar(parcelas, |p| p.edificabilidad.sup_edificable_planta));
    edif.sup_max_edificable = Some(sumar(parcelas, |p| p.edificabilidad.sup_max_edificable));
    edif.plusvalia.plusvalia_em = Some(sumar(parcelas, |p| p.edificabilidad.plusvalia.plusvalia_em));
    edif.plusvalia.plusvalia_pl = Some(sumar(parcelas, |p| p.edificabilidad.plusvalia.plusvalia_pl));
    edif.plusvalia.plusvalia_sl = Some(sumar(parcelas, |p| p.edificabilidad.plusvalia.plusvalia_sl));

    informe.geometria.features = parcelas
        .iter()
        .flat_map(|p| p.geometria.features.iter().cloned())
        .collect();

    if let Some(centro) = centroide(parcelas) {
        informe.coordenadas = Some(centro);
    }

    // Unión de direcciones: parcelas linderas pueden compartir frente.
    let mut vistas = HashSet::new();
    informe.direcciones = parcelas
        .iter()
        .flat_map(|p| p.direcciones.iter())
        .filter(|d| vistas.insert(d.clave()))
        .cloned()
        .collect();

    info!(
        parcelas = componentes.len(),
        smp = %informe.smp,
        superficie,
        "informe consolidado"
    );

    Ok(ConsolidatedReport {
        informe,
        componentes,
    })
}

fn sumar(parcelas: &[ParcelReport], campo: impl Fn(&ParcelReport) -> Option<f64>) -> f64 {
    parcelas.iter().map(|p| defaults::numero(campo(p))).sum()
}

/// Suma valores en formato local; lo que no se pueda leer cuenta como cero.
fn sumar_locales(
    parcelas: &[ParcelReport],
    nombre: &'static str,
    campo: impl Fn(&ParcelReport) -> Option<&NumeroLocal>,
) -> f64 {
    parcelas
        .iter()
        .map(|p| {
            let valor = campo(p);
            if let Some(crudo) = valor {
                if crudo.as_f64().is_none() {
                    warn!(smp = %p.smp, campo = nombre, valor = ?crudo, "valor numérico ilegible, se suma como 0");
                }
            }
            defaults::numero_local(valor)
        })
        .sum()
}

/// Promedio de coordenadas; `None` si alguna parcela no las tiene.
fn centroide(parcelas: &[ParcelReport]) -> Option<Coordenadas> {
    let coordenadas: Option<Vec<Coordenadas>> = parcelas.iter().map(|p| p.coordenadas).collect();
    let coordenadas = coordenadas?;
    let n = coordenadas.len() as f64;
    if n == 0.0 {
        return None;
    }
    Some(Coordenadas {
        lat: coordenadas.iter().map(|c| c.lat).sum::<f64>() / n,
        lng: coordenadas.iter().map(|c| c.lng).sum::<f64>() / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direccion, Feature};
    use crate::numero::parse_locale;

    fn parcela(smp: &str, superficie: &str, linderos: &[&str]) -> ParcelReport {
        let mut p = ParcelReport {
            smp: smp.to_string(),
            linderos: linderos.iter().map(|s| s.to_string()).collect(),
            direcciones: vec![Direccion {
                calle: format!("Calle {smp}"),
                altura: Some(100),
                direccion_normalizada: String::new(),
            }],
            coordenadas: Some(Coordenadas {
                lat: -34.6,
                lng: -58.4,
            }),
            ..Default::default()
        };
        p.datos_catastrales.superficie = Some(NumeroLocal::from(superficie));
        p.datos_catastrales.frente = Some(NumeroLocal::from(10.0));
        p.geometria.features.push(Feature {
            tipo: "Feature".into(),
            geometry: serde_json::json!({"type": "Point", "coordinates": [0, 0]}),
            properties: Default::default(),
        });
        p
    }

    fn cadena() -> Vec<ParcelReport> {
        vec![
            parcela("A", "100,5", &["B"]),
            parcela("B", "50", &["A", "C"]),
            parcela("C", "25,25", &["B"]),
        ]
    }

    #[test]
    fn sums_locale_surfaces() {
        let consolidado = consolidar(&cadena()).unwrap();
        let superficie = consolidado.informe.datos_catastrales.superficie.as_ref();

        assert_eq!(superficie.and_then(NumeroLocal::as_f64), Some(175.75));
        assert_eq!(parse_locale("175,75"), Some(175.75));
        assert_eq!(
            consolidado.informe.datos_catastrales.frente,
            Some(NumeroLocal::Texto("30".into()))
        );
    }

    #[test]
    fn merges_identifiers_geometry_and_addresses() {
        let consolidado = consolidar(&cadena()).unwrap();

        assert_eq!(consolidado.informe.smp, "A, B, C");
        assert_eq!(consolidado.componentes, vec!["A", "B", "C"]);
        assert_eq!(consolidado.informe.geometria.features.len(), 3);
        let calles: Vec<_> = consolidado
            .informe
            .direcciones
            .iter()
            .map(|d| d.calle.as_str())
            .collect();
        assert_eq!(calles, vec!["Calle A", "Calle B", "Calle C"]);
    }

    #[test]
    fn shared_frontage_address_appears_once() {
        let esquina = Direccion {
            calle: "Cabildo".into(),
            altura: Some(2000),
            direccion_normalizada: "CABILDO 2000".into(),
        };
        let mut a = parcela("A", "100", &["B"]);
        let mut b = parcela("B", "50", &["A"]);
        a.direcciones = vec![esquina.clone()];
        b.direcciones = vec![
            Direccion {
                direccion_normalizada: "cabildo  2000".into(),
                ..esquina
            },
            Direccion {
                calle: "Juramento".into(),
                altura: Some(1500),
                direccion_normalizada: String::new(),
            },
        ];

        let consolidado = consolidar(&[a, b]).unwrap();
        let calles: Vec<_> = consolidado
            .informe
            .direcciones
            .iter()
            .map(|d| d.calle.as_str())
            .collect();
        assert_eq!(calles, vec!["Cabildo", "Juramento"]);
    }

    #[test]
    fn sums_buildability_treating_missing_as_zero() {
        let mut parcelas = cadena();
        parcelas[0].edificabilidad.sup_max_edificable = Some(400.0);
        parcelas[2].edificabilidad.sup_max_edificable = Some(150.5);
        parcelas[1].edificabilidad.plusvalia.plusvalia_em = Some(12.0);

        let consolidado = consolidar(&parcelas).unwrap();
        let edif = &consolidado.informe.edificabilidad;

        assert_eq!(edif.sup_max_edificable, Some(550.5));
        assert_eq!(edif.plusvalia.plusvalia_em, Some(12.0));
        assert_eq!(edif.plusvalia.plusvalia_sl, Some(0.0));
    }

    #[test]
    fn averages_coordinates_only_when_all_present() {
        let mut parcelas = cadena();
        parcelas[1].coordenadas = Some(Coordenadas {
            lat: -34.9,
            lng: -58.1,
        });
        let consolidado = consolidar(&parcelas).unwrap();
        let centro = consolidado.informe.coordenadas.unwrap();
        assert!((centro.lat - (-34.7)).abs() < 1e-9);
        assert!((centro.lng - (-58.3)).abs() < 1e-9);

        parcelas[2].coordenadas = None;
        let consolidado = consolidar(&parcelas).unwrap();
        assert_eq!(consolidado.informe.coordenadas, parcelas[0].coordenadas);
    }

    #[test]
    fn malformed_numbers_count_as_zero() {
        let mut parcelas = cadena();
        parcelas[1].datos_catastrales.superficie = Some(NumeroLocal::from("s/d"));

        let consolidado = consolidar(&parcelas).unwrap();
        let superficie = consolidado.informe.datos_catastrales.superficie.as_ref();
        assert_eq!(superficie.and_then(NumeroLocal::as_f64), Some(125.75));
    }

    #[test]
    fn single_parcel_is_an_independent_copy() {
        let original = parcela("A", "100,5", &[]);
        let mut consolidado = consolidar(std::slice::from_ref(&original)).unwrap();

        assert_eq!(consolidado.informe, original);
        consolidado.informe.geometria.features.clear();
        consolidado.informe.smp.push_str("-mod");
        assert_eq!(original.geometria.features.len(), 1);
        assert_eq!(original.smp, "A");
    }

    #[test]
    fn refuses_non_contiguous_sets() {
        let parcelas = vec![parcela("A", "1", &["B"]), parcela("C", "1", &["Z"])];
        assert!(matches!(
            consolidar(&parcelas),
            Err(ValidationError::NoContiguas { .. })
        ));
    }
}
