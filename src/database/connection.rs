use log::error;
use openssl::ssl::{SslConnector, SslMethod};
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::{Client, NoTls};
use url::Url;

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, String> {
    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| format!("SSL builder error: {}", e))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| format!("Error loading CA cert: {}", e))?;

    Ok(MakeTlsConnector::new(builder.build()))
}

/// How to reach the database, resolved once at startup
#[derive(Clone)]
pub struct DatabaseTarget {
    url: String,
    tls: Option<MakeTlsConnector>,
}

impl DatabaseTarget {
    /// Split the `sslrootcert` parameter off a connection URL
    ///
    /// libpq understands `sslrootcert`, tokio-postgres does not, so it is
    /// removed from the URL and turned into a TLS connector instead. Without
    /// it the connection is made in plaintext.
    pub fn parse(database_url: &str) -> Result<Self, String> {
        let (url, sslrootcert_path) = strip_sslrootcert(database_url)?;
        let tls = sslrootcert_path
            .as_deref()
            .map(create_ssl_connector)
            .transpose()?;

        Ok(DatabaseTarget { url, tls })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new connection and drive it in the background
    pub async fn connect(&self) -> Result<Client, tokio_postgres::Error> {
        match &self.tls {
            Some(connector) => {
                let (client, connection) =
                    tokio_postgres::connect(&self.url, connector.clone()).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                Ok(client)
            }
            None => {
                let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                Ok(client)
            }
        }
    }
}

fn strip_sslrootcert(database_url: &str) -> Result<(String, Option<String>), String> {
    let url = Url::parse(database_url).map_err(|e| format!("URL parse error: {}", e))?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    Ok((clean_url.to_string(), sslrootcert_path))
}
