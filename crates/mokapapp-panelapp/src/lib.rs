#![forbid(unsafe_code)]

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use mokapapp_core::{PanelError, RawGene, RawPanel};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Blocking JSON GET against the registry.
pub trait PanelAppTransport {
    /// Any non-success status is a [`PanelError::Network`]; an unreadable
    /// body is a [`PanelError::MalformedResponse`].
    #[allow(clippy::missing_errors_doc)]
    fn get_json(&self, url: &str) -> Result<Value, PanelError>;
}

#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl PanelAppTransport for UreqTransport {
    fn get_json(&self, url: &str) -> Result<Value, PanelError> {
        debug!(url, "GET");
        match self.agent.get(url).call() {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|err| PanelError::MalformedResponse(format!("{url}: {err}"))),
            Err(ureq::Error::Status(code, _)) => Err(PanelError::Network(format!(
                "{url} returned http status {code}"
            ))),
            Err(ureq::Error::Transport(err)) => {
                Err(PanelError::Network(format!("{url}: http transport failure: {err}")))
            }
        }
    }
}

/// Listing endpoints of the registry. Detail pages live under `panels`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PanelAppEndpoints {
    pub panels: String,
    pub signed_off_panels: String,
}

impl PanelAppEndpoints {
    fn detail_url(&self, id: u64, version: &str, signed_off: bool) -> String {
        let base = self.panels.trim_end_matches('/');
        if signed_off {
            format!("{base}/{id}?version={version}")
        } else {
            format!("{base}/{id}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct PanelAppSource<T> {
    transport: T,
    endpoints: PanelAppEndpoints,
}

impl<T: PanelAppTransport> PanelAppSource<T> {
    #[must_use]
    pub fn new(transport: T, endpoints: PanelAppEndpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    #[must_use]
    pub fn endpoints(&self) -> &PanelAppEndpoints {
        &self.endpoints
    }

    /// Starts a fresh pass over both listings: signed-off panels first, then
    /// general panels whose id was not already yielded. Nothing is requested
    /// until the stream is polled, and `limit` caps the merged output.
    #[must_use]
    pub fn fetch(&self, limit: Option<usize>) -> PanelStream<'_, T> {
        info!(
            signed_off = %self.endpoints.signed_off_panels,
            panels = %self.endpoints.panels,
            limit = ?limit,
            "fetching panels from registry"
        );
        PanelStream {
            transport: &self.transport,
            endpoints: &self.endpoints,
            listing: Listing::SignedOff,
            pending: VecDeque::new(),
            next_page: Some(self.endpoints.signed_off_panels.clone()),
            seen_ids: BTreeSet::new(),
            yielded: 0,
            limit,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Listing {
    SignedOff,
    General,
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    results: Vec<ListingEntry>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    id: Option<u64>,
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PanelDetail {
    genes: Vec<DetailGene>,
}

#[derive(Debug, Deserialize)]
struct DetailGene {
    gene_data: GeneData,
    confidence_level: String,
}

#[derive(Debug, Deserialize)]
struct GeneData {
    hgnc_id: String,
    hgnc_symbol: String,
}

/// Lazy merged sequence of registry panels. Stops for good after the first
/// error; restart by calling [`PanelAppSource::fetch`] again.
pub struct PanelStream<'a, T> {
    transport: &'a T,
    endpoints: &'a PanelAppEndpoints,
    listing: Listing,
    pending: VecDeque<ListingEntry>,
    next_page: Option<String>,
    seen_ids: BTreeSet<u64>,
    yielded: usize,
    limit: Option<usize>,
    finished: bool,
}

impl<T: PanelAppTransport> PanelStream<'_, T> {
    fn load_page(&mut self, url: &str) -> Result<(), PanelError> {
        let page: ListingPage = parse(url, self.transport.get_json(url)?)?;
        debug!(
            url,
            results = page.results.len(),
            has_next = page.next.is_some(),
            "listing page"
        );
        self.pending.extend(page.results);
        self.next_page = page.next.filter(|next| !next.is_empty());
        Ok(())
    }

    fn enrich(&self, entry: ListingEntry) -> Result<RawPanel, PanelError> {
        let signed_off = self.listing == Listing::SignedOff;
        let Some(id) = entry.id else {
            warn!(name = %entry.name, "registry panel without id");
            return Ok(RawPanel {
                id: None,
                name: entry.name,
                version: entry.version,
                genes: Vec::new(),
                signed_off,
            });
        };

        let url = self.endpoints.detail_url(id, &entry.version, signed_off);
        let detail: PanelDetail = parse(&url, self.transport.get_json(&url)?)?;
        let genes = detail
            .genes
            .into_iter()
            .map(|gene| RawGene {
                hgnc_id: gene.gene_data.hgnc_id,
                symbol: gene.gene_data.hgnc_symbol,
                confidence: gene.confidence_level,
            })
            .collect::<Vec<_>>();
        debug!(panel_id = id, genes = genes.len(), signed_off, "panel detail");

        Ok(RawPanel {
            id: Some(id),
            name: entry.name,
            version: entry.version,
            genes,
            signed_off,
        })
    }

    fn fail(&mut self, err: PanelError) -> Option<Result<RawPanel, PanelError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<T: PanelAppTransport> Iterator for PanelStream<'_, T> {
    type Item = Result<RawPanel, PanelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }

        loop {
            if let Some(entry) = self.pending.pop_front() {
                if let Some(id) = entry.id {
                    if !self.seen_ids.insert(id) {
                        debug!(panel_id = id, "panel already yielded from signed-off listing");
                        continue;
                    }
                }
                return match self.enrich(entry) {
                    Ok(panel) => {
                        self.yielded += 1;
                        Some(Ok(panel))
                    }
                    Err(err) => self.fail(err),
                };
            }

            if let Some(url) = self.next_page.take() {
                if let Err(err) = self.load_page(&url) {
                    return self.fail(err);
                }
                continue;
            }

            match self.listing {
                Listing::SignedOff => {
                    self.listing = Listing::General;
                    self.next_page = Some(self.endpoints.panels.clone());
                }
                Listing::General => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

fn parse<D: DeserializeOwned>(url: &str, body: Value) -> Result<D, PanelError> {
    serde_json::from_value(body).map_err(|err| PanelError::MalformedResponse(format!("{url}: {err}")))
}
