//! Chromium-backed automation source using chromiumoxide.
//!
//! Drives the car consultation form of the FIPE price table: four chained
//! dropdowns (reference period, brand, model, model-year), a search button
//! and a result table. Options are matched by exact label, so a brand such
//! as "Rover" never selects "Land Rover".

use super::{
    AutomationSource, Extraction, LeafReport, NodePath, Selection, SourceFactory, SourceFault,
    SourceResult,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Dropdowns, root level first.
const SELECTS: [&str; 4] = [
    "#selectTabelaReferenciacarro",
    "#selectMarcacarro",
    "#selectAnoModelocarro",
    "#selectAnocarro",
];
const SEARCH_BUTTON: &str = "#buttonPesquisarcarro";
const CLEAR_BUTTON: &str = "#buttonLimparPesquisarcarro";
const RESULT_CELLS: &str = "#resultadoConsultacarroFiltros table td";
const CARS_TAB: &str = "Consulta de Carros e Utilitários Pequenos";
/// Result table cells holding the model code and the average price.
const CODE_CELL: usize = 3;
const PRICE_CELL: usize = 15;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Find the Chromium binary path.
pub fn find_chromium(configured: Option<&Path>) -> Option<PathBuf> {
    // 1. FIPE_CHROMIUM_PATH
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }

    // 2. ~/.fipe/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".fipe/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".fipe/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".fipe/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".fipe/chromium/chrome-linux64/chrome"),
                home.join(".fipe/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launch settings for [`ChromiumFactory`].
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub chromium_path: Option<PathBuf>,
    pub base_url: String,
    /// Wait budget of a single interaction.
    pub timeout: Duration,
}

/// Opens one headless browser per session.
pub struct ChromiumFactory {
    settings: BrowserSettings,
}

impl ChromiumFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceFactory for ChromiumFactory {
    async fn open(&self) -> SourceResult<Box<dyn AutomationSource>> {
        let session = FipeSession::launch(&self.settings).await?;
        Ok(Box::new(session))
    }
}

/// A live browser on the consultation page.
pub struct FipeSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
    timeout: Duration,
}

impl FipeSession {
    pub async fn launch(settings: &BrowserSettings) -> SourceResult<Self> {
        let chrome_path = find_chromium(settings.chromium_path.as_deref()).ok_or_else(|| {
            SourceFault::Unclassified("Chromium not found; set FIPE_CHROMIUM_PATH".into())
        })?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .build()
            .map_err(|e| SourceFault::Unclassified(format!("failed to build browser config: {e}")))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SourceFault::Interaction(format!("failed to launch Chromium: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = match open_page(&browser, settings).await {
            Ok(page) => page,
            Err(fault) => {
                if let Err(e) = close_browser(&mut browser, &handler).await {
                    warn!("{e}");
                }
                return Err(fault);
            }
        };

        let mut session = Self {
            browser,
            handler,
            page,
            timeout: settings.timeout,
        };
        if let Err(fault) = session.open_cars_tab().await {
            if let Err(e) = close_browser(&mut session.browser, &session.handler).await {
                warn!("{e}");
            }
            return Err(fault);
        }
        debug!("consultation page ready at {}", settings.base_url);
        Ok(session)
    }

    async fn open_cars_tab(&mut self) -> SourceResult<()> {
        let script = format!(
            r#"(() => {{
                const link = Array.from(document.querySelectorAll('a'))
                    .find(a => a.textContent.trim().startsWith('{tab}'));
                if (!link) return false;
                link.click();
                return true;
            }})()"#,
            tab = sanitize_js_string(CARS_TAB)
        );
        if !self.poll(&script, "cars tab").await?.as_bool().unwrap_or(false) {
            return Err(SourceFault::Lookup("cars tab link".into()));
        }
        let ready = format!("document.querySelector('{}') !== null", SELECTS[0]);
        self.poll(&ready, "reference period dropdown").await?;
        Ok(())
    }

    async fn execute_js(&self, script: &str) -> SourceResult<serde_json::Value> {
        let result = match tokio::time::timeout(self.timeout, self.page.evaluate(script)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(SourceFault::Interaction(format!("JS execution failed: {e}"))),
            Err(_) => return Err(SourceFault::Timeout("JS execution".into())),
        };
        result
            .into_value()
            .map_err(|e| SourceFault::Lookup(format!("failed to convert JS result: {e:?}")))
    }

    /// Evaluate `script` until it yields something truthy and non-empty.
    async fn poll(&self, script: &str, what: &str) -> SourceResult<serde_json::Value> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let value = self.execute_js(script).await?;
            if is_ready(&value) {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(SourceFault::Timeout(format!(
                    "{what} after {}ms",
                    self.timeout.as_millis()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Option labels of a dropdown, once loaded.
    async fn options(&self, select: &str) -> SourceResult<Vec<String>> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{select}');
                if (!el) return null;
                return Array.from(el.options).map(o => o.textContent.trim()).filter(t => t.length > 0);
            }})()"#
        );
        let value = match self.poll(&script, select).await {
            Ok(value) => value,
            Err(SourceFault::Timeout(what)) => {
                // A loaded dropdown with no option is a legitimate empty listing.
                if self.exists(select).await? {
                    return Ok(Vec::new());
                }
                return Err(SourceFault::Timeout(what));
            }
            Err(e) => return Err(e),
        };
        serde_json::from_value(value)
            .map_err(|e| SourceFault::Lookup(format!("options of {select}: {e}")))
    }

    async fn exists(&self, select: &str) -> SourceResult<bool> {
        let value = self
            .execute_js(&format!("document.querySelector('{select}') !== null"))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Pick the option labelled exactly `label`.
    async fn choose(&self, select: &str, label: &str) -> SourceResult<Selection> {
        let options = self.options(select).await?;
        if !options.iter().any(|o| o == label) {
            return Ok(Selection::Absent);
        }
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{select}');
                const option = Array.from(el.options).find(o => o.textContent.trim() === '{label}');
                if (!option) return false;
                if (window.jQuery) {{
                    window.jQuery(el).val(option.value).trigger('chosen:updated').trigger('change');
                }} else {{
                    el.value = option.value;
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                }}
                return true;
            }})()"#,
            label = sanitize_js_string(label)
        );
        if self.execute_js(&script).await?.as_bool() != Some(true) {
            return Err(SourceFault::Interaction(format!("could not select '{label}' in {select}")));
        }
        Ok(Selection::Selected)
    }

    async fn click(&self, selector: &str) -> SourceResult<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('{selector}');
                if (!el) return false;
                el.click();
                return true;
            }})()"#
        );
        if self.execute_js(&script).await?.as_bool() != Some(true) {
            return Err(SourceFault::Interaction(format!("could not click {selector}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationSource for FipeSession {
    async fn list_children(&mut self, path: &NodePath) -> SourceResult<Vec<String>> {
        let select = SELECTS
            .get(path.depth())
            .ok_or_else(|| SourceFault::Lookup(format!("{path} has no children")))?;
        self.options(select).await
    }

    async fn select_path(&mut self, path: &NodePath) -> SourceResult<Selection> {
        for (select, label) in SELECTS.iter().zip(path.segments()) {
            if self.choose(select, label).await? == Selection::Absent {
                debug!("{path}: no option '{label}' in {select}");
                return Ok(Selection::Absent);
            }
        }
        Ok(Selection::Selected)
    }

    async fn extract_leaf(&mut self) -> SourceResult<Extraction> {
        self.click(SEARCH_BUTTON).await?;
        let script = format!(
            r#"(() => {{
                if (document.body.innerText.includes('Nada encontrado')) return {{ absent: true }};
                const cells = Array.from(document.querySelectorAll('{RESULT_CELLS}'))
                    .map(td => td.textContent.trim());
                return cells.length > {PRICE_CELL} ? {{ cells }} : null;
            }})()"#
        );
        let value = self.poll(&script, "result table").await?;
        if value.get("absent").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(Extraction::Absent);
        }
        let cells: Vec<String> = value
            .get("cells")
            .cloned()
            .map(serde_json::from_value::<Vec<String>>)
            .transpose()
            .map_err(|e| SourceFault::Lookup(format!("result table: {e}")))?
            .unwrap_or_default();

        let price = cells
            .get(PRICE_CELL)
            .ok_or_else(|| SourceFault::Lookup("price cell".into()))?;
        let value = parse_brl_price(price)
            .ok_or_else(|| SourceFault::Lookup(format!("unparsable price '{price}'")))?;
        let model_code = cells
            .get(CODE_CELL)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        // The form is reset after every leaf.
        self.click(CLEAR_BUTTON).await?;
        Ok(Extraction::Observation(LeafReport { value, model_code }))
    }

    async fn close(mut self: Box<Self>) -> SourceResult<()> {
        close_browser(&mut self.browser, &self.handler).await
    }
}

async fn open_page(browser: &Browser, settings: &BrowserSettings) -> SourceResult<Page> {
    let navigation = browser.new_page(settings.base_url.as_str());
    let page = match tokio::time::timeout(settings.timeout, navigation).await {
        Ok(Ok(page)) => page,
        Ok(Err(e)) => return Err(SourceFault::Interaction(format!("navigation failed: {e}"))),
        Err(_) => {
            return Err(SourceFault::Timeout(format!(
                "navigation to {} after {}ms",
                settings.base_url,
                settings.timeout.as_millis()
            )))
        }
    };
    let _ = page.wait_for_navigation().await;
    Ok(page)
}

/// Close the browser and stop its event handler, even when closing fails.
async fn close_browser(browser: &mut Browser, handler: &JoinHandle<()>) -> SourceResult<()> {
    let closed = browser.close().await;
    handler.abort();
    closed
        .map(|_| ())
        .map_err(|e| SourceFault::Interaction(format!("failed to close Chromium: {e}")))
}

/// Parse a Brazilian currency string such as `R$ 45.000,00`.
pub fn parse_brl_price(text: &str) -> Option<f64> {
    let digits: String = text
        .trim()
        .trim_start_matches("R$")
        .trim()
        .chars()
        .filter(|c| *c != '.')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn is_ready(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Escape a string for embedding inside a single-quoted JS literal.
fn sanitize_js_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\0' => {}
            '<' => result.push_str("\\x3c"),
            '>' => result.push_str("\\x3e"),
            _ => result.push(ch),
        }
    }
    result
}
