//! Seed templates for stores that have never held a statement.

use futures_util::future::LocalBoxFuture;

use crate::error::StorageError;

/// Default statements shipped with the crate.
const BUNDLED_TEMPLATE: &[u8] = include_bytes!("template.json");

/// Source of the planning seed template, fetched by URI.
///
/// The bytes must parse as a JSON array of statements; the cache reports
/// anything else as [`StorageError::SeedFetchFailed`].
pub trait TemplateSource {
    fn fetch<'a>(&'a self, uri: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, StorageError>>;
}

/// Serves a fixed byte buffer regardless of URI.
#[derive(Debug, Clone)]
pub struct StaticTemplateSource {
    bytes: Vec<u8>,
}

impl StaticTemplateSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The template bundled into the crate.
    pub fn bundled() -> Self {
        Self::new(BUNDLED_TEMPLATE)
    }
}

impl TemplateSource for StaticTemplateSource {
    fn fetch<'a>(&'a self, _uri: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move { Ok(self.bytes.clone()) })
    }
}

/// Fetches the template over HTTP from the serving origin.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Default)]
pub struct FetchTemplateSource;

#[cfg(target_arch = "wasm32")]
impl FetchTemplateSource {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_arch = "wasm32")]
impl TemplateSource for FetchTemplateSource {
    fn fetch<'a>(&'a self, uri: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            use wasm_bindgen::JsCast;
            use wasm_bindgen_futures::JsFuture;

            let window = web_sys::window()
                .ok_or_else(|| StorageError::SeedFetchFailed("no window object".to_string()))?;
            let response = JsFuture::from(window.fetch_with_str(uri))
                .await
                .map_err(|e| StorageError::SeedFetchFailed(format!("GET {uri} failed: {e:?}")))?;
            let response: web_sys::Response = response.dyn_into().map_err(|_| {
                StorageError::SeedFetchFailed("fetch did not produce a Response".to_string())
            })?;
            if !response.ok() {
                return Err(StorageError::SeedFetchFailed(format!(
                    "GET {uri} returned status {}",
                    response.status()
                )));
            }
            let buffer = response
                .array_buffer()
                .map_err(|e| StorageError::SeedFetchFailed(format!("{e:?}")))?;
            let buffer = JsFuture::from(buffer)
                .await
                .map_err(|e| StorageError::SeedFetchFailed(format!("{e:?}")))?;
            Ok(js_sys::Uint8Array::new(&buffer).to_vec())
        })
    }
}
