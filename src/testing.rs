//! Test doubles and tracing bootstrap

use crate::{
    ActivationPayload, Bundle, BundleId, ChargeRecord, Eligibility, IdempotencyKey, JobRef,
    JobStatus, OrderReceipt, OrderRequest, PartnerApi, PartnerCallError, ResellerId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Install a fmt subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Europe bundle priced at 50 USD
pub fn sample_bundle() -> Bundle {
    Bundle {
        id: BundleId::new("eu-5gb"),
        name: "Europe 5GB / 30 days".into(),
        price: Decimal::from(50),
        currency: "USD".into(),
        validity_days: 30,
        countries: vec!["FR".into(), "DE".into(), "ES".into()],
        regions: vec!["Europe".into()],
    }
}

/// 55 USD charge for [`sample_bundle`] with 10% markup
pub fn sample_charge() -> ChargeRecord {
    ChargeRecord {
        charge_ref: "le-1".into(),
        reseller: ResellerId::new("r1"),
        base_amount: Decimal::from(50),
        markup_percent: Decimal::from(10),
        amount: Decimal::new(5500, 2),
        currency: "USD".into(),
        key: IdempotencyKey("wf:test:charge".into()),
        charged_at: Utc::now(),
    }
}

struct PartnerState {
    catalogue: Vec<Bundle>,
    eligible: bool,
    active_bundles: u32,
    duplicate: bool,
    order_failure: Option<PartnerCallError>,
    accept_despite_failure: bool,
    order_expiry: Option<DateTime<Utc>>,
    lookup_failure: Option<PartnerCallError>,
    status_failure: Option<PartnerCallError>,
    new_order_script: VecDeque<JobStatus>,
    scripts: HashMap<JobRef, VecDeque<JobStatus>>,
    orders: HashMap<IdempotencyKey, OrderReceipt>,
    fetches: HashMap<JobRef, u32>,
    calls: Vec<&'static str>,
    next_order: u64,
}

/// Programmable partner API.
///
/// Orders are numbered `ord-1`, `ord-2`, ... Each new order takes a copy of
/// the configured status script; once the script is down to its last entry
/// that entry repeats forever.
pub struct ScriptedPartner {
    state: Mutex<PartnerState>,
    status_latency: Mutex<Duration>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl ScriptedPartner {
    /// Partner selling [`sample_bundle`]; orders go straight to `ready`
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PartnerState {
                catalogue: vec![sample_bundle()],
                eligible: true,
                active_bundles: 0,
                duplicate: false,
                order_failure: None,
                accept_despite_failure: false,
                order_expiry: None,
                lookup_failure: None,
                status_failure: None,
                new_order_script: VecDeque::from([JobStatus::new("ready")]),
                scripts: HashMap::new(),
                orders: HashMap::new(),
                fetches: HashMap::new(),
                calls: Vec::new(),
                next_order: 1,
            }),
            status_latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut PartnerState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Replace the catalogue
    pub fn set_catalogue(&self, bundles: Vec<Bundle>) {
        self.with(|s| s.catalogue = bundles);
    }

    /// Answer eligibility checks with `eligible`
    pub fn set_eligible(&self, eligible: bool) {
        self.with(|s| s.eligible = eligible);
    }

    /// Active bundle count reported on eligibility
    pub fn set_active_bundles(&self, count: u32) {
        self.with(|s| s.active_bundles = count);
    }

    /// Report every contact as already holding the bundle
    pub fn set_duplicate(&self, duplicate: bool) {
        self.with(|s| s.duplicate = duplicate);
    }

    /// Expiry returned with new orders
    pub fn set_order_expiry(&self, expiry: Option<DateTime<Utc>>) {
        self.with(|s| s.order_expiry = expiry);
    }

    /// Make `place_order` fail; with `accept_anyway` the order still lands
    /// partner-side, as after a timeout on the response path.
    pub fn fail_orders_with(&self, failure: Option<PartnerCallError>, accept_anyway: bool) {
        self.with(|s| {
            s.order_failure = failure;
            s.accept_despite_failure = accept_anyway;
        });
    }

    /// Make `find_order` fail
    pub fn fail_lookups_with(&self, failure: Option<PartnerCallError>) {
        self.with(|s| s.lookup_failure = failure);
    }

    /// Make `get_status` fail
    pub fn fail_status_with(&self, failure: Option<PartnerCallError>) {
        self.with(|s| s.status_failure = failure);
    }

    /// Status sequence handed to every order placed from now on
    pub fn script_new_orders(&self, statuses: &[&str]) {
        self.with(|s| {
            s.new_order_script = statuses.iter().map(|st| JobStatus::new(*st)).collect();
        });
    }

    /// Status sequence for a specific job, placed or not
    pub fn script_job(&self, job_ref: &JobRef, statuses: &[&str]) {
        self.with(|s| {
            s.scripts.insert(
                job_ref.clone(),
                statuses.iter().map(|st| JobStatus::new(*st)).collect(),
            );
        });
    }

    /// Delay every `get_status` call
    pub fn set_status_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.status_latency.lock() {
            *l = latency;
        }
    }

    /// Distinct orders accepted
    pub fn orders_placed(&self) -> usize {
        self.with(|s| s.orders.len())
    }

    /// `get_status` calls made for `job_ref`
    pub fn status_fetches(&self, job_ref: &JobRef) -> u32 {
        self.with(|s| s.fetches.get(job_ref).copied().unwrap_or(0))
    }

    /// Highest number of `get_status` calls that were running at once
    pub fn peak_concurrent_fetches(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Names of the calls made, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.with(|s| s.calls.clone())
    }
}

impl Default for ScriptedPartner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartnerApi for ScriptedPartner {
    async fn list_bundles(&self) -> Result<Vec<Bundle>, PartnerCallError> {
        Ok(self.with(|s| {
            s.calls.push("list_bundles");
            s.catalogue.clone()
        }))
    }

    async fn validate_eligibility(
        &self,
        _contact: &str,
        _bundle_id: &BundleId,
    ) -> Result<Eligibility, PartnerCallError> {
        Ok(self.with(|s| {
            s.calls.push("validate_eligibility");
            Eligibility {
                eligible: s.eligible,
                active_bundles: s.active_bundles,
                reason: (!s.eligible).then(|| "contact flagged by partner".into()),
            }
        }))
    }

    async fn check_duplicate(
        &self,
        _contact: &str,
        _bundle_id: &BundleId,
    ) -> Result<bool, PartnerCallError> {
        Ok(self.with(|s| {
            s.calls.push("check_duplicate");
            s.duplicate
        }))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, PartnerCallError> {
        self.with(|s| {
            s.calls.push("place_order");
            if let Some(existing) = s.orders.get(&request.order_key) {
                return Ok(existing.clone());
            }
            if let Some(failure) = s.order_failure.clone() {
                if !s.accept_despite_failure {
                    return Err(failure);
                }
            }

            let order_ref = JobRef::new(format!("ord-{}", s.next_order));
            s.next_order += 1;
            let script = s.new_order_script.clone();
            s.scripts.entry(order_ref.clone()).or_insert(script);

            let receipt = OrderReceipt {
                order_ref: order_ref.clone(),
                iccid: format!("8944{:015}", s.next_order).into(),
                activation: ActivationPayload {
                    smdp_address: "smdp.partner.example".into(),
                    matching_id: format!("MATCH-{order_ref}").into(),
                    qr_code: Some(format!("LPA:1$smdp.partner.example$MATCH-{order_ref}").into()),
                },
                status: JobStatus::new("pending"),
                expires_at: s.order_expiry,
            };
            s.orders.insert(request.order_key.clone(), receipt.clone());

            match s.order_failure.clone() {
                Some(failure) => Err(failure),
                None => Ok(receipt),
            }
        })
    }

    async fn get_status(&self, order_ref: &JobRef) -> Result<JobStatus, PartnerCallError> {
        let latency = self
            .status_latency
            .lock()
            .map(|l| *l)
            .unwrap_or(Duration::ZERO);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.with(|s| {
            s.calls.push("get_status");
            *s.fetches.entry(order_ref.clone()).or_insert(0) += 1;
            if let Some(failure) = s.status_failure.clone() {
                return Err(failure);
            }
            let script = s.scripts.entry(order_ref.clone()).or_default();
            let status = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            Ok(status.unwrap_or_else(|| JobStatus::new("pending")))
        })
    }

    async fn find_order(
        &self,
        order_key: &IdempotencyKey,
    ) -> Result<Option<OrderReceipt>, PartnerCallError> {
        self.with(|s| {
            s.calls.push("find_order");
            if let Some(failure) = s.lookup_failure.clone() {
                return Err(failure);
            }
            Ok(s.orders.get(order_key).cloned())
        })
    }
}
