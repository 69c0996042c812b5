//! Multi-schema routing on top of the series builder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weir_types::value::Value;
use weir_types::{
    Batch, Diagnostic, DiagnosticHandler, EngineError, SchemaRegistry, Type,
};

use super::record::{record_signature, BuildCtx, Node, RecordNode, RecordRef};
use super::series::SeriesBuilder;
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT};

/// How rows map to schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// All rows share one builder; the schema is the growing union.
    Merge {
        seed_schema: Option<String>,
        reset_on_yield: bool,
    },
    /// One builder per distinct row signature; with a seed schema, every
    /// row gets exactly that schema.
    Precise { seed_schema: Option<String> },
    /// The value of a named field selects the schema by name.
    Selector {
        field: String,
        prefix: Option<String>,
        /// Drop the selector field from the output row.
        unique: bool,
    },
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Precise { seed_schema: None }
    }
}

/// Builder-wide settings shared by all policies.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Schema name used when neither seed nor selector determines one.
    pub default_schema_name: String,
    /// Flush the previous builder when the active builder changes, so that
    /// output preserves input order.
    pub ordered: bool,
    /// Only fields of a known schema are accepted.
    pub schema_only: bool,
    /// Keep deferred scalars as plain strings.
    pub raw: bool,
    /// Separator that desugars flat field names into nested records.
    pub unnest_separator: Option<String>,
    /// Flush a builder that has not yielded for this long.
    pub timeout: Duration,
    /// Flush a builder once it holds this many rows.
    pub desired_batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_schema_name: "weir.unknown".to_string(),
            ordered: true,
            schema_only: false,
            raw: false,
            unnest_separator: None,
            timeout: DEFAULT_BATCH_TIMEOUT,
            desired_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

struct Entry {
    builder: SeriesBuilder,
    last_flush: Instant,
}

/// The adaptive multi-schema event builder.
///
/// Single-threaded and non-blocking; the host operator yields whenever
/// [`MultiBuilder::yield_ready`] hands back batches.
pub struct MultiBuilder {
    policy: Policy,
    settings: Settings,
    dh: Arc<dyn DiagnosticHandler>,
    registry: Arc<SchemaRegistry>,
    /// Known schemas by name, used for seeding.
    schemas: HashMap<String, Type>,
    ctx: BuildCtx,
    pending: Option<RecordNode>,
    entries: Vec<Entry>,
    signature_map: HashMap<Vec<u8>, usize>,
    name_map: HashMap<String, usize>,
    active: usize,
    ready: Vec<Batch>,
    sig_buf: Vec<u8>,
}

impl MultiBuilder {
    pub fn new(
        policy: Policy,
        settings: Settings,
        dh: Arc<dyn DiagnosticHandler>,
        registry: Arc<SchemaRegistry>,
        known_schemas: Vec<Type>,
    ) -> Result<Self, EngineError> {
        let schemas: HashMap<String, Type> = known_schemas
            .into_iter()
            .filter_map(|ty| ty.name.clone().map(|name| (name, ty)))
            .collect();
        let ctx = BuildCtx {
            unnest_separator: settings.unnest_separator.clone(),
            raw: settings.raw,
        };
        let mut this = Self {
            policy,
            settings,
            dh,
            registry,
            schemas,
            ctx,
            pending: None,
            entries: Vec::new(),
            signature_map: HashMap::new(),
            name_map: HashMap::new(),
            active: 0,
            ready: Vec::new(),
            sig_buf: Vec::new(),
        };
        // Merge mode and seeded precise mode route everything into one
        // builder created up front.
        match this.policy.clone() {
            Policy::Merge { seed_schema, .. } | Policy::Precise { seed_schema } => {
                if let Some(name) = &seed_schema {
                    if !this.schemas.contains_key(name) {
                        return Err(EngineError::lookup(format!("unknown schema `{name}`")));
                    }
                }
                if matches!(this.policy, Policy::Merge { .. }) || seed_schema.is_some() {
                    let seed = seed_schema.as_ref().and_then(|n| this.schemas.get(n)).cloned();
                    this.entries.push(Entry {
                        builder: SeriesBuilder::new(
                            seed.as_ref(),
                            seed_schema,
                            this.settings.schema_only,
                        ),
                        last_flush: Instant::now(),
                    });
                }
            }
            Policy::Selector { .. } => {
                if this.settings.schema_only && this.schemas.is_empty() {
                    return Err(EngineError::invalid_configuration(
                        "selector with schema-only requires known schemas",
                    ));
                }
            }
        }
        Ok(this)
    }

    /// Begin a new row. Committing the previous row happens here, which is
    /// why the returned guard must be dropped before the next call.
    pub fn record(&mut self) -> RecordRef<'_> {
        self.commit_pending();
        let node = self.pending.insert(RecordNode::default());
        RecordRef::new(node, &self.ctx)
    }

    /// Drop the most recent row, pending or committed.
    pub fn remove_last(&mut self) {
        if self.pending.take().is_none() {
            if let Some(entry) = self.entries.get_mut(self.active) {
                entry.builder.pop_row();
            }
        }
    }

    /// Hand back every batch that is ready: full builders, timed-out
    /// builders, and batches flushed by ordered builder switches.
    pub fn yield_ready(&mut self) -> Vec<Batch> {
        self.commit_pending();
        let timeout = self.settings.timeout;
        let reset = matches!(self.policy, Policy::Merge { reset_on_yield: true, .. });
        for index in 0..self.entries.len() {
            let expired = self.entries[index].last_flush.elapsed() >= timeout;
            if !self.entries[index].builder.is_empty() && (expired || reset) {
                self.flush_entry(index);
            }
        }
        std::mem::take(&mut self.ready)
    }

    /// Flush everything and hand back the final batches.
    pub fn finalize(&mut self) -> Vec<Batch> {
        self.commit_pending();
        for index in 0..self.entries.len() {
            if !self.entries[index].builder.is_empty() {
                self.flush_entry(index);
            }
        }
        std::mem::take(&mut self.ready)
    }

    fn commit_pending(&mut self) {
        let Some(row) = self.pending.take() else {
            return;
        };
        match self.policy.clone() {
            Policy::Merge { .. } => self.append_row(0, row),
            Policy::Precise { seed_schema: Some(_) } => self.append_row(0, row),
            Policy::Precise { seed_schema: None } => {
                self.sig_buf.clear();
                let mut sig = std::mem::take(&mut self.sig_buf);
                record_signature(&row, &mut sig);
                let index = match self.signature_map.get(&sig) {
                    Some(&index) => index,
                    None => {
                        let index = self.entries.len();
                        self.entries.push(Entry {
                            builder: SeriesBuilder::new(None, None, false),
                            last_flush: Instant::now(),
                        });
                        self.signature_map.insert(sig.clone(), index);
                        index
                    }
                };
                self.sig_buf = sig;
                self.append_row(index, row);
            }
            Policy::Selector { field, prefix, unique } => {
                let selector = match row.get(&field) {
                    Some(Node::Scalar(Value::String(s))) => Some(s.clone()),
                    Some(Node::Unparsed(s)) => Some(s.clone()),
                    Some(Node::Null) | Some(Node::Unset) | None => None,
                    Some(other) => {
                        Diagnostic::warning(format!(
                            "selector field `{field}` must be a string, got {}",
                            match other {
                                Node::Scalar(v) => v.kind_name(),
                                Node::Record(_) => "record",
                                Node::List(_) => "list",
                                _ => "null",
                            }
                        ))
                        .emit(&*self.dh);
                        None
                    }
                };
                match selector {
                    None if self.settings.schema_only => {
                        Diagnostic::warning(format!(
                            "row has no `{field}` selector and is skipped"
                        ))
                        .emit(&*self.dh);
                    }
                    None => {
                        let name = self.settings.default_schema_name.clone();
                        let index = self.entry_by_name(&name);
                        self.append_row(index, row);
                    }
                    Some(value) => {
                        let name = match &prefix {
                            Some(prefix) => format!("{prefix}.{value}"),
                            None => value,
                        };
                        let mut row = row;
                        if unique {
                            row.remove(&field);
                        }
                        let index = self.entry_by_name(&name);
                        self.append_row(index, row);
                    }
                }
            }
        }
    }

    fn entry_by_name(&mut self, name: &str) -> usize {
        if let Some(&index) = self.name_map.get(name) {
            return index;
        }
        let seed = self.schemas.get(name).cloned();
        let index = self.entries.len();
        self.entries.push(Entry {
            builder: SeriesBuilder::new(
                seed.as_ref(),
                Some(name.to_string()),
                self.settings.schema_only,
            ),
            last_flush: Instant::now(),
        });
        self.name_map.insert(name.to_string(), index);
        index
    }

    fn append_row(&mut self, index: usize, row: RecordNode) {
        if self.settings.ordered
            && index != self.active
            && self
                .entries
                .get(self.active)
                .is_some_and(|e| !e.builder.is_empty())
        {
            self.flush_entry(self.active);
        }
        self.active = index;
        self.entries[index].builder.push_row(row, &*self.dh);
        if self.entries[index].builder.len() >= self.settings.desired_batch_size {
            self.flush_entry(index);
        }
    }

    fn flush_entry(&mut self, index: usize) {
        let default_name = self.settings.default_schema_name.clone();
        let entry = &mut self.entries[index];
        entry.last_flush = Instant::now();
        match entry.builder.finish(&self.registry, &*self.dh, &default_name) {
            Ok(Some(batch)) => self.ready.push(batch),
            Ok(None) => {}
            Err(e) => {
                Diagnostic::error(format!("failed to materialize batch: {e}")).emit(&*self.dh);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_types::{DiagnosticCollector, Field, TypeKind};

    fn builder(policy: Policy, settings: Settings) -> (MultiBuilder, Arc<DiagnosticCollector>) {
        let dh = Arc::new(DiagnosticCollector::new());
        let registry = Arc::new(SchemaRegistry::new());
        let b = MultiBuilder::new(policy, settings, dh.clone(), registry, Vec::new()).unwrap();
        (b, dh)
    }

    fn small_batches() -> Settings {
        Settings {
            timeout: Duration::ZERO,
            ..Settings::default()
        }
    }

    #[test]
    fn test_precise_routes_by_signature() {
        let (mut b, _dh) = builder(Policy::Precise { seed_schema: None }, small_batches());
        {
            let mut r = b.record();
            r.field("a").data(1i64);
            r.field("b").data("x");
        }
        {
            let mut r = b.record();
            r.field("a").data(2i64);
            r.field("b").data("y");
            r.field("c").data(true);
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].rows(), 1);
        assert_eq!(batches[0].num_columns(), 2);
        assert_eq!(batches[1].rows(), 1);
        assert_eq!(batches[1].num_columns(), 3);
    }

    #[test]
    fn test_precise_same_signature_shares_builder() {
        let (mut b, _dh) = builder(Policy::Precise { seed_schema: None }, small_batches());
        for i in 0..3i64 {
            let mut r = b.record();
            r.field("a").data(i);
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows(), 3);
    }

    #[test]
    fn test_merge_unions_schemas() {
        let (mut b, _dh) = builder(
            Policy::Merge { seed_schema: None, reset_on_yield: false },
            small_batches(),
        );
        {
            let mut r = b.record();
            r.field("a").data(1i64);
        }
        {
            let mut r = b.record();
            r.field("b").data("x");
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows(), 2);
        assert_eq!(batches[0].num_columns(), 2);
        assert_eq!(batches[0].value_at(1, 0).unwrap(), Value::Null);
    }

    #[test]
    fn test_selector_names_schemas_with_prefix() {
        let (mut b, _dh) = builder(
            Policy::Selector {
                field: "event_type".into(),
                prefix: Some("suricata".into()),
                unique: false,
            },
            small_batches(),
        );
        {
            let mut r = b.record();
            r.field("event_type").data_unparsed("flow");
            r.field("src").data_unparsed("10.0.0.1");
        }
        {
            let mut r = b.record();
            r.field("event_type").data_unparsed("alert");
            r.field("sig").data_unparsed("ET");
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].schema_name(), "suricata.flow");
        assert_eq!(batches[1].schema_name(), "suricata.alert");
    }

    #[test]
    fn test_unique_selector_drops_selector_field() {
        let (mut b, _dh) = builder(
            Policy::Selector {
                field: "kind".into(),
                prefix: None,
                unique: true,
            },
            small_batches(),
        );
        {
            let mut r = b.record();
            r.field("kind").data_unparsed("flow");
            r.field("x").data(1i64);
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].schema_name(), "flow");
        assert_eq!(batches[0].num_columns(), 1);
        let fields = batches[0].schema().record_fields().unwrap();
        assert_eq!(fields[0].name, "x");
    }

    #[test]
    fn test_selector_missing_field_falls_back_to_inference() {
        let (mut b, dh) = builder(
            Policy::Selector { field: "kind".into(), prefix: None, unique: false },
            small_batches(),
        );
        {
            let mut r = b.record();
            r.field("x").data(1i64);
        }
        let batches = b.finalize();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].schema_name(), "weir.unknown");
        assert!(dh.snapshot().is_empty());
    }

    #[test]
    fn test_selector_missing_field_skips_under_schema_only() {
        let dh = Arc::new(DiagnosticCollector::new());
        let registry = Arc::new(SchemaRegistry::new());
        let known = vec![Type::named(
            "flow",
            TypeKind::Record(vec![Field::new("x", Type::new(TypeKind::Int64))]),
        )];
        let mut b = MultiBuilder::new(
            Policy::Selector { field: "kind".into(), prefix: None, unique: false },
            Settings { schema_only: true, timeout: Duration::ZERO, ..Settings::default() },
            dh.clone(),
            registry,
            known,
        )
        .unwrap();
        {
            let mut r = b.record();
            r.field("x").data(1i64);
        }
        let batches = b.finalize();
        assert!(batches.is_empty());
        let warnings = dh.snapshot();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("selector"));
    }

    #[test]
    fn test_desired_batch_size_flushes() {
        let (mut b, _dh) = builder(
            Policy::Precise { seed_schema: None },
            Settings {
                desired_batch_size: 2,
                timeout: Duration::from_secs(3600),
                ..Settings::default()
            },
        );
        for i in 0..5i64 {
            let mut r = b.record();
            r.field("a").data(i);
        }
        // Exactly desired_batch_size rows produce exactly one batch.
        let ready = b.yield_ready();
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|batch| batch.rows() == 2));
        let last = b.finalize();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].rows(), 1);
    }

    #[test]
    fn test_ordered_switch_flushes_previous_builder() {
        let (mut b, _dh) = builder(
            Policy::Precise { seed_schema: None },
            Settings { timeout: Duration::from_secs(3600), ..Settings::default() },
        );
        {
            let mut r = b.record();
            r.field("a").data(1i64);
        }
        {
            let mut r = b.record();
            r.field("b").data("x");
        }
        // The switch from schema {a} to {b} must have flushed {a} already.
        let ready = b.yield_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].num_columns(), 1);
        let fields = ready[0].schema().record_fields().unwrap();
        assert_eq!(fields[0].name, "a");
    }

    #[test]
    fn test_timeout_flushes_on_yield() {
        let (mut b, _dh) = builder(Policy::Precise { seed_schema: None }, small_batches());
        {
            let mut r = b.record();
            r.field("a").data(1i64);
        }
        // Zero timeout: the row is available on the next yield.
        let ready = b.yield_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].rows(), 1);
    }

    #[test]
    fn test_remove_last_drops_pending_row() {
        let (mut b, _dh) = builder(Policy::Precise { seed_schema: None }, small_batches());
        {
            let mut r = b.record();
            r.field("a").data(1i64);
        }
        b.remove_last();
        assert!(b.finalize().is_empty());
    }

    #[test]
    fn test_unknown_seed_schema_is_a_lookup_error() {
        let dh = Arc::new(DiagnosticCollector::new());
        let registry = Arc::new(SchemaRegistry::new());
        let result = MultiBuilder::new(
            Policy::Precise { seed_schema: Some("nope".into()) },
            Settings::default(),
            dh,
            registry,
            Vec::new(),
        );
        assert!(matches!(result, Err(EngineError::Lookup(_))));
    }
}
