//! Cliente de la API externa de catastro y zonificación.
//!
//! El núcleo sólo depende del trait [`CatastroApi`]; [`HttpCatastroClient`]
//! es la implementación real sobre HTTP/JSON.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::{ParcelReport, PrecioAdicional, RespuestaCalculo, TipoInforme};

/// Opciones de la consulta de una dirección.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcionesConsulta {
    /// Informe completo en lugar del básico.
    #[serde(default)]
    pub completo: bool,
    /// La consulta forma parte de un informe compuesto.
    #[serde(default)]
    pub compuesto: bool,
    /// No descontar créditos por esta consulta.
    #[serde(default)]
    pub omitir_creditos: bool,
}

impl OpcionesConsulta {
    pub fn tipo(&self) -> TipoInforme {
        match (self.compuesto, self.completo) {
            (true, _) => TipoInforme::Compuesto,
            (false, true) => TipoInforme::Completo,
            (false, false) => TipoInforme::Basico,
        }
    }
}

/// Resultado de resolver una dirección.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolucionDireccion {
    Informe(Box<ParcelReport>),
    /// Otra petición para la misma dirección ya se está procesando en el servidor.
    EnProceso,
}

/// Respuesta del endpoint de guardado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespuestaGuardado {
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Operaciones del colaborador externo que consume el núcleo.
#[async_trait]
pub trait CatastroApi: Send + Sync {
    async fn resolver_direccion(
        &self,
        direccion: &str,
        opciones: OpcionesConsulta,
    ) -> Result<ResolucionDireccion>;

    /// Identificador de un informe ya existente para la dirección y el tipo.
    async fn informe_existente(&self, direccion: &str, tipo: TipoInforme) -> Result<Option<String>>;

    async fn calcular(&self, informe: &ParcelReport) -> Result<RespuestaCalculo>;

    async fn guardar(
        &self,
        informe: &ParcelReport,
        tipo: TipoInforme,
        huella: &str,
    ) -> Result<RespuestaGuardado>;

    async fn informe_compartido(&self, token: &str) -> Result<ParcelReport>;

    async fn historial(&self) -> Result<Vec<String>>;

    async fn agregar_historial(&self, direccion: &str) -> Result<()>;

    /// Lista de servicios adicionales y sus precios.
    async fn precios_adicionales(&self) -> Result<Vec<PrecioAdicional>>;
}

#[derive(Serialize)]
struct ConsultaPayload<'a> {
    direccion: &'a str,
    #[serde(flatten)]
    opciones: OpcionesConsulta,
}

#[derive(Serialize)]
struct GuardarPayload<'a> {
    informe: &'a ParcelReport,
    tipo: TipoInforme,
}

#[derive(Deserialize)]
struct ExistentePayload {
    id: Option<String>,
}

#[derive(Deserialize)]
struct HistorialPayload {
    #[serde(default)]
    direcciones: Vec<String>,
}

#[derive(Deserialize)]
struct PreciosPayload {
    #[serde(default)]
    precios: Vec<PrecioAdicional>,
}

/// Cliente HTTP de la API del catastro.
#[derive(Debug, Clone)]
pub struct HttpCatastroClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpCatastroClient {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let mut base = Url::parse(&cfg.catastro_api_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = header::HeaderMap::new();
        if let Some(token) = &cfg.catastro_api_token {
            let mut valor = header::HeaderValue::from_str(&format!("Bearer {token}"))?;
            valor.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, valor);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(cfg.catastro_timeout_secs))
            .build()?;

        info!("Cliente del catastro apuntando a {base}");
        Ok(Self { http, base })
    }

    fn url(&self, ruta: &str) -> Result<Url> {
        self.base
            .join(ruta)
            .map_err(|e| Error::Decode(format!("ruta inválida '{ruta}': {e}")))
    }

    /// El token viaja como un único segmento codificado.
    fn url_compartido(&self, token: &str) -> Result<Url> {
        let mut url = self.url("reportes/compartidos/")?;
        url.path_segments_mut()
            .map_err(|_| Error::Decode(format!("la URL base {} no admite rutas", self.base)))?
            .pop_if_empty()
            .push(token);
        Ok(url)
    }

    async fn leer<T: DeserializeOwned>(respuesta: reqwest::Response) -> Result<T> {
        let status = respuesta.status();
        if !status.is_success() {
            let message = respuesta.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        respuesta
            .json::<T>()
            .await
            .map_err(|e| Error::Decode(e.to_string()))
    }
}

#[async_trait]
impl CatastroApi for HttpCatastroClient {
    async fn resolver_direccion(
        &self,
        direccion: &str,
        opciones: OpcionesConsulta,
    ) -> Result<ResolucionDireccion> {
        debug!(direccion, ?opciones, "resolviendo dirección");
        let respuesta = self
            .http
            .post(self.url("reportes/consultar")?)
            .json(&ConsultaPayload { direccion, opciones })
            .send()
            .await?;

        if respuesta.status() == StatusCode::CONFLICT {
            return Ok(ResolucionDireccion::EnProceso);
        }
        let informe: ParcelReport = Self::leer(respuesta).await?;
        Ok(ResolucionDireccion::Informe(Box::new(informe)))
    }

    async fn informe_existente(&self, direccion: &str, tipo: TipoInforme) -> Result<Option<String>> {
        let respuesta = self
            .http
            .get(self.url("reportes/existente")?)
            .query(&[("direccion", direccion), ("tipo", tipo.as_str())])
            .send()
            .await?;

        if respuesta.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let existente: ExistentePayload = Self::leer(respuesta).await?;
        Ok(existente.id)
    }

    async fn calcular(&self, informe: &ParcelReport) -> Result<RespuestaCalculo> {
        let respuesta = self
            .http
            .post(self.url("reportes/calcular")?)
            .json(informe)
            .send()
            .await?;
        Self::leer(respuesta).await
    }

    async fn guardar(
        &self,
        informe: &ParcelReport,
        tipo: TipoInforme,
        huella: &str,
    ) -> Result<RespuestaGuardado> {
        let respuesta = self
            .http
            .post(self.url("reportes/guardar")?)
            .header("Idempotency-Key", huella)
            .json(&GuardarPayload { informe, tipo })
            .send()
            .await?;
        Self::leer(respuesta).await
    }

    async fn informe_compartido(&self, token: &str) -> Result<ParcelReport> {
        let respuesta = self
            .http
            .get(self.url_compartido(token)?)
            .send()
            .await?;
        Self::leer(respuesta).await
    }

    async fn historial(&self) -> Result<Vec<String>> {
        let respuesta = self.http.get(self.url("historial")?).send().await?;
        let historial: HistorialPayload = Self::leer(respuesta).await?;
        Ok(historial.direcciones)
    }

    async fn agregar_historial(&self, direccion: &str) -> Result<()> {
        let respuesta = self
            .http
            .post(self.url("historial")?)
            .json(&serde_json::json!({ "direccion": direccion }))
            .send()
            .await?;
        let status = respuesta.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: respuesta.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn precios_adicionales(&self) -> Result<Vec<PrecioAdicional>> {
        let respuesta = self.http.get(self.url("precios/adicionales")?).send().await?;
        let precios: PreciosPayload = Self::leer(respuesta).await?;
        Ok(precios.precios)
    }
}
