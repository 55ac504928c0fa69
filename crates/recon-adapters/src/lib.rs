//! External-system adapters: the identity-provider and e-commerce HTTP
//! clients, plus the file-ingest adapters that turn CSV extracts and CRM
//! merge logs into staging rows.

use std::sync::LazyLock;
use std::time::Duration;

use recon_core::{
    normalize_email, parse_created_on, AccountMetadata, DirectoryUser, EcommerceProfile,
    IdentityAccount, MergedContactMapping, MetadataPatch, NewStagingRecord, ProfilePatch,
};
use regex::Regex;
pub use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("token endpoint returned no access token")]
    MissingToken,
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(AdapterError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Identity-provider client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IdentityProviderConfig {
    pub domain: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub timeout: Duration,
}

/// Wire shape of one account as the provider returns it.
#[derive(Debug, Deserialize)]
struct WireAccount {
    #[serde(rename = "user_id")]
    account_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    last_login: Option<String>,
    #[serde(default, rename = "user_metadata")]
    metadata: AccountMetadata,
}

impl From<WireAccount> for IdentityAccount {
    fn from(wire: WireAccount) -> Self {
        IdentityAccount {
            account_id: wire.account_id,
            email: wire.email,
            last_login: wire.last_login,
            metadata: wire.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Client for the identity-provider management API. The access token from
/// the client-credentials grant is cached for the lifetime of the client,
/// i.e. one batch run; there is no refresh on expiry, an expired token
/// surfaces as per-call HTTP errors that the propagator logs.
#[derive(Debug)]
pub struct IdentityProviderClient {
    http: reqwest::Client,
    config: IdentityProviderConfig,
    token: Mutex<Option<String>>,
}

pub fn document_search_query(document_number: &str) -> String {
    format!("user_metadata.document_number:(\"{document_number}\")")
}

/// Contact ids are stored with inconsistent casing upstream, so the search
/// matches both spellings.
pub fn contact_id_search_query(contact_id: &str) -> String {
    format!(
        "user_metadata.contact_id:(\"{}\"OR\"{}\")",
        contact_id.to_lowercase(),
        contact_id.to_uppercase()
    )
}

impl IdentityProviderClient {
    pub fn new(config: IdentityProviderConfig) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn base_url(&self) -> String {
        format!("https://{}/api/v2", self.config.domain)
    }

    /// Client-credentials token exchange. Failing here is fatal to the
    /// whole batch request, unlike the per-row lookup and patch errors.
    pub async fn authenticate(&self) -> Result<String, AdapterError> {
        let url = format!("https://{}/oauth/token", self.config.domain);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "audience": self.config.audience,
                "grant_type": "client_credentials",
            }))
            .send()
            .await?;
        let body: TokenResponse = ensure_success(response).await?.json().await?;
        body.access_token.ok_or(AdapterError::MissingToken)
    }

    async fn bearer(&self) -> Result<String, AdapterError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.authenticate().await?;
        info!("identity-provider token acquired");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Exact lookup by normalized email. The provider may hold several
    /// accounts for one email; only the first result is returned and the
    /// rest are discarded, a known precision limitation.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<IdentityAccount>, AdapterError> {
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        let token = self.bearer().await?;
        let url = format!("{}/users-by-email", self.base_url());
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("email", email.as_str())])
            .send()
            .await?;
        let accounts: Vec<WireAccount> = ensure_success(response).await?.json().await?;
        Ok(accounts.into_iter().next().map(IdentityAccount::from))
    }

    /// Metadata search by document number. Document numbers are not unique
    /// in the provider (household members can share a tax id), so this
    /// legitimately returns zero, one or many accounts.
    pub async fn find_by_document(
        &self,
        document_number: &str,
    ) -> Result<Vec<IdentityAccount>, AdapterError> {
        self.search(&document_search_query(document_number)).await
    }

    pub async fn find_by_contact_id(
        &self,
        contact_id: &str,
    ) -> Result<Vec<IdentityAccount>, AdapterError> {
        self.search(&contact_id_search_query(contact_id)).await
    }

    async fn search(&self, query: &str) -> Result<Vec<IdentityAccount>, AdapterError> {
        let token = self.bearer().await?;
        let url = format!("{}/users", self.base_url());
        debug!(query, "identity-provider metadata search");
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("q", query), ("search_engine", "v3")])
            .send()
            .await?;
        let accounts: Vec<WireAccount> = ensure_success(response).await?.json().await?;
        Ok(accounts.into_iter().map(IdentityAccount::from).collect())
    }

    /// Merge-patch of the account metadata: the body carries only the keys
    /// present in `patch`, the provider keeps every other metadata key.
    pub async fn patch_metadata(
        &self,
        account_id: &str,
        patch: &MetadataPatch,
    ) -> Result<(), AdapterError> {
        let token = self.bearer().await?;
        let url = format!("{}/users/{}", self.base_url(), account_id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "user_metadata": patch }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<StatusCode, AdapterError> {
        let token = self.bearer().await?;
        let url = format!("{}/users/{}", self.base_url(), account_id);
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.status())
    }
}

// ---------------------------------------------------------------------------
// E-commerce client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EcommerceConfig {
    pub base_url: String,
    pub app_key: String,
    pub app_token: String,
    pub timeout: Duration,
}

const PROFILE_FIELDS: &str = "id,email,document,firstName,lastName,socioFlag,contactId";
const APP_KEY_HEADER: &str = "X-Store-AppKey";
const APP_TOKEN_HEADER: &str = "X-Store-AppToken";

/// Client for the e-commerce customer record store. Auth is two static
/// API-key headers on every request.
#[derive(Debug)]
pub struct EcommerceClient {
    http: reqwest::Client,
    config: EcommerceConfig,
}

impl EcommerceClient {
    pub fn new(config: EcommerceConfig) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Accept", "application/json")
            .header(APP_KEY_HEADER, &self.config.app_key)
            .header(APP_TOKEN_HEADER, &self.config.app_token)
    }

    pub async fn get_by_id(
        &self,
        ecommerce_user_id: &str,
    ) -> Result<Option<EcommerceProfile>, AdapterError> {
        let url = format!(
            "{}/documents/{}?_fields={}",
            self.config.base_url, ecommerce_user_id, PROFILE_FIELDS
        );
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile: EcommerceProfile = ensure_success(response).await?.json().await?;
        Ok(Some(profile))
    }

    /// Exact-match search by email through the store's filter syntax.
    pub async fn get_by_email(&self, email: &str) -> Result<Vec<EcommerceProfile>, AdapterError> {
        let url = format!("{}/search", self.config.base_url);
        let response = self
            .request(reqwest::Method::GET, url)
            .query(&[("_fields", PROFILE_FIELDS), ("_where", &format!("email={email}"))])
            .send()
            .await?;
        let profiles: Vec<EcommerceProfile> = ensure_success(response).await?.json().await?;
        Ok(profiles)
    }

    /// Field-level merge: the patch only carries present, non-empty fields
    /// (see [`ProfilePatch`]), so remote fields are never cleared by an
    /// empty input.
    pub async fn patch_profile(
        &self,
        ecommerce_user_id: &str,
        patch: &ProfilePatch,
    ) -> Result<(), AdapterError> {
        let url = format!("{}/documents/{}", self.config.base_url, ecommerce_user_id);
        let response = self
            .request(reqwest::Method::PATCH, url)
            .json(patch)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn patch_contact_id(
        &self,
        ecommerce_user_id: &str,
        contact_id: &str,
    ) -> Result<(), AdapterError> {
        self.patch_profile(ecommerce_user_id, &ProfilePatch::contact_id(contact_id))
            .await
    }

    pub async fn delete_by_id(&self, ecommerce_user_id: &str) -> Result<StatusCode, AdapterError> {
        let url = format!("{}/documents/{}", self.config.base_url, ecommerce_user_id);
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.status())
    }
}

// ---------------------------------------------------------------------------
// CSV ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("csv parse failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Some exports wrap every cell in single quotes; strip them before use.
fn strip_quotes(raw: &str) -> String {
    raw.trim().trim_matches('\'').to_string()
}

fn non_empty(raw: &str) -> Option<String> {
    let cleaned = strip_quotes(raw);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[derive(Debug, Deserialize)]
struct StagingCsvRow {
    #[serde(rename = "CreatedOn", default)]
    created_on: Option<String>,
    #[serde(rename = "ContactId", default)]
    contact_id: Option<String>,
    #[serde(rename = "EMailAddress1", default)]
    email: Option<String>,
    #[serde(rename = "FirstName", default)]
    first_name: Option<String>,
    #[serde(rename = "LastName", default)]
    last_name: Option<String>,
    #[serde(rename = "GenderCode", default)]
    gender_code: Option<String>,
    #[serde(rename = "Gender", default)]
    gender_source: Option<String>,
    #[serde(rename = "BirthDate", default)]
    birth_date: Option<String>,
    #[serde(rename = "DocumentType", default)]
    document_type: Option<String>,
    #[serde(rename = "DocumentNumber", default)]
    document_number: Option<String>,
    #[serde(rename = "ActiveSubscriptions", default)]
    active_subscriptions: Option<String>,
}

/// Parse the semicolon-separated CRM extract into staging rows. Cells are
/// kept as text; only the subscription count and timestamp are typed here.
pub fn parse_staging_csv(data: &[u8]) -> Result<Vec<NewStagingRecord>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_reader(data);
    let mut records = Vec::new();
    for row in reader.deserialize::<StagingCsvRow>() {
        let row = row?;
        records.push(NewStagingRecord {
            contact_id: row.contact_id.as_deref().and_then(non_empty),
            email: row.email.as_deref().and_then(non_empty),
            first_name: row.first_name.as_deref().and_then(non_empty),
            last_name: row.last_name.as_deref().and_then(non_empty),
            gender_code: row.gender_code.as_deref().and_then(non_empty),
            gender_source: row.gender_source.as_deref().and_then(non_empty),
            birth_date: row.birth_date.as_deref().and_then(non_empty),
            document_type: row.document_type.as_deref().and_then(non_empty),
            document_number: row.document_number.as_deref().and_then(non_empty),
            active_subscriptions: row
                .active_subscriptions
                .as_deref()
                .and_then(non_empty)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            created_on: row
                .created_on
                .as_deref()
                .and_then(non_empty)
                .and_then(|v| parse_created_on(&v)),
        });
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct DirectoryCsvRow {
    #[serde(rename = "Id", default)]
    account_id: Option<String>,
    #[serde(rename = "Email", default)]
    email: Option<String>,
    #[serde(rename = "first_name", default)]
    first_name: Option<String>,
    #[serde(rename = "last_name", default)]
    last_name: Option<String>,
    #[serde(rename = "gender", default)]
    gender: Option<String>,
    #[serde(rename = "birthday", default)]
    birthday: Option<String>,
    #[serde(rename = "document_number", default)]
    document_number: Option<String>,
    #[serde(rename = "document_type", default)]
    document_type: Option<String>,
    #[serde(rename = "contact_id", default)]
    contact_id: Option<String>,
    #[serde(rename = "Last Login", default)]
    last_login: Option<String>,
}

#[derive(Debug, Default)]
pub struct DirectoryImport {
    pub users: Vec<DirectoryUser>,
    /// Rows missing the account id or email required to join on.
    pub skipped: usize,
}

/// Parse the comma-separated identity-provider directory export.
pub fn parse_directory_csv(data: &[u8]) -> Result<DirectoryImport, IngestError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(data);
    let mut import = DirectoryImport::default();
    for row in reader.deserialize::<DirectoryCsvRow>() {
        let row = row?;
        let account_id = row.account_id.as_deref().and_then(non_empty);
        let email = row.email.as_deref().and_then(non_empty);
        let (Some(account_id), Some(email)) = (account_id, email) else {
            import.skipped += 1;
            continue;
        };
        import.users.push(DirectoryUser {
            account_id,
            email: Some(email),
            first_name: row.first_name.as_deref().and_then(non_empty),
            last_name: row.last_name.as_deref().and_then(non_empty),
            gender: row.gender.as_deref().and_then(non_empty),
            birthday: row.birthday.as_deref().and_then(non_empty),
            document_number: row.document_number.as_deref().and_then(non_empty),
            document_type: row.document_type.as_deref().and_then(non_empty),
            contact_id: row.contact_id.as_deref().and_then(non_empty),
            last_login: row.last_login.as_deref().and_then(non_empty),
        });
    }
    Ok(import)
}

// ---------------------------------------------------------------------------
// CRM merge-log ingest
// ---------------------------------------------------------------------------

static MERGE_LOG_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"dni=(\d+)").expect("static regex"));
static MERGE_LOG_CONTACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .expect("static regex")
});

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeLogParse {
    pub mappings: Vec<MergedContactMapping>,
    /// Document numbers that were replaced or left unpaired at end of file.
    pub dropped_documents: usize,
    /// Contact ids that were replaced or left unpaired at end of file.
    pub dropped_contacts: usize,
}

/// Scan a CRM merge log line by line. The grammar is two regexes: a
/// `dni=<digits>` token carries a document number and a UUID token carries
/// the surviving contact id. The most recent unconsumed document pairs with
/// the most recent unconsumed contact id; once paired, both slots reset.
/// Values replaced before pairing or dangling at end of file are counted in
/// the result instead of disappearing silently.
pub fn parse_merge_log(text: &str) -> MergeLogParse {
    let mut parse = MergeLogParse::default();
    let mut pending_document: Option<String> = None;
    let mut pending_contact: Option<String> = None;

    for line in text.lines() {
        if let Some(captures) = MERGE_LOG_DOCUMENT.captures(line) {
            if pending_document.replace(captures[1].to_string()).is_some() {
                parse.dropped_documents += 1;
            }
        }
        if let Some(captures) = MERGE_LOG_CONTACT.captures(line) {
            if pending_contact.replace(captures[1].to_string()).is_some() {
                parse.dropped_contacts += 1;
            }
        }
        if pending_document.is_some() && pending_contact.is_some() {
            if let (Some(document_number), Some(contact_id)) =
                (pending_document.take(), pending_contact.take())
            {
                parse.mappings.push(MergedContactMapping {
                    contact_id,
                    document_number,
                });
            }
        }
    }

    if pending_document.is_some() {
        parse.dropped_documents += 1;
    }
    if pending_contact.is_some() {
        parse.dropped_contacts += 1;
    }
    parse
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_log_pairs_document_with_following_contact_id() {
        let log = "\
2024-03-01 merge requested dni=11788802\n\
merging: primary contact will be 1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed\n\
2024-03-01 merge requested dni=22334455\n\
merging: primary contact will be 6ba7b810-9dad-11d1-80b4-00c04fd430c8\n";
        let parse = parse_merge_log(log);
        assert_eq!(
            parse.mappings,
            vec![
                MergedContactMapping {
                    contact_id: "1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed".into(),
                    document_number: "11788802".into(),
                },
                MergedContactMapping {
                    contact_id: "6ba7b810-9dad-11d1-80b4-00c04fd430c8".into(),
                    document_number: "22334455".into(),
                },
            ]
        );
        assert_eq!(parse.dropped_documents, 0);
        assert_eq!(parse.dropped_contacts, 0);
    }

    #[test]
    fn merge_log_pairs_within_a_single_line() {
        let log = "dni=99887766 merged into 1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed\n";
        let parse = parse_merge_log(log);
        assert_eq!(parse.mappings.len(), 1);
        assert_eq!(parse.mappings[0].document_number, "99887766");
    }

    #[test]
    fn merge_log_reports_dangling_document_at_eof() {
        let log = "some noise\ndni=11788802\nmore noise without a contact id\n";
        let parse = parse_merge_log(log);
        assert!(parse.mappings.is_empty());
        assert_eq!(parse.dropped_documents, 1);
        assert_eq!(parse.dropped_contacts, 0);
    }

    #[test]
    fn merge_log_counts_replaced_documents() {
        let log = "\
dni=111\n\
dni=222\n\
primary contact 1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed\n";
        let parse = parse_merge_log(log);
        assert_eq!(parse.mappings.len(), 1);
        assert_eq!(parse.mappings[0].document_number, "222");
        assert_eq!(parse.dropped_documents, 1);
    }

    #[test]
    fn staging_csv_parses_semicolon_extract() {
        let csv = "\
CreatedOn;ContactId;EMailAddress1;FirstName;LastName;GenderCode;Gender;BirthDate;DocumentType;DocumentNumber;ActiveSubscriptions\n\
2023-06-01 10:30:00;'abc-1';'Ana@Example.com';Ana;Diaz;2;femenino;05-03-1987;DNI;11788802;3\n\
;;;;;;;;;;\n";
        let records = parse_staging_csv(csv.as_bytes()).expect("parse");
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.contact_id.as_deref(), Some("abc-1"));
        assert_eq!(first.email.as_deref(), Some("Ana@Example.com"));
        assert_eq!(first.document_number.as_deref(), Some("11788802"));
        assert_eq!(first.active_subscriptions, 3);
        assert!(first.created_on.is_some());
        let empty = &records[1];
        assert_eq!(empty.email, None);
        assert_eq!(empty.active_subscriptions, 0);
    }

    #[test]
    fn directory_csv_skips_rows_missing_join_keys() {
        let csv = "\
first_name,last_name,gender,birthday,document_number,document_type,contact_id,Id,Email,Last Login\n\
'Ana','Diaz','fem','05-03-1987','11788802','DNI','abc-1','auth|123','ana@example.com','2024-01-01'\n\
'Bob','NoId','masc','','','','','','bob@example.com',''\n";
        let import = parse_directory_csv(csv.as_bytes()).expect("parse");
        assert_eq!(import.users.len(), 1);
        assert_eq!(import.skipped, 1);
        let user = &import.users[0];
        assert_eq!(user.account_id, "auth|123");
        assert_eq!(user.document_number.as_deref(), Some("11788802"));
    }

    #[test]
    fn search_queries_quote_the_key() {
        assert_eq!(
            document_search_query("11788802"),
            "user_metadata.document_number:(\"11788802\")"
        );
        assert_eq!(
            contact_id_search_query("Abc-1"),
            "user_metadata.contact_id:(\"abc-1\"OR\"ABC-1\")"
        );
    }

    #[test]
    fn wire_account_maps_to_domain_account() {
        let body = serde_json::json!({
            "user_id": "auth|42",
            "email": "ana@example.com",
            "last_login": "2024-01-01T00:00:00.000Z",
            "user_metadata": {
                "contact_id": "abc-1",
                "document_number": "11788802",
                "active_subscriptions": 2,
                "ecommerce_user_id": "ec-9"
            }
        });
        let wire: WireAccount = serde_json::from_value(body).expect("deserialize");
        let account = IdentityAccount::from(wire);
        assert_eq!(account.account_id, "auth|42");
        assert_eq!(account.metadata.contact_id.as_deref(), Some("abc-1"));
        assert_eq!(account.metadata.active_subscriptions, Some(2));
        assert_eq!(account.metadata.ecommerce_user_id.as_deref(), Some("ec-9"));
    }

    #[test]
    fn wire_account_tolerates_missing_metadata() {
        let body = serde_json::json!({ "user_id": "auth|7" });
        let wire: WireAccount = serde_json::from_value(body).expect("deserialize");
        let account = IdentityAccount::from(wire);
        assert_eq!(account.metadata, AccountMetadata::default());
    }
}
