// Statement execution.
//
// The executor drives the table heap, lock manager, version store and CRDT
// merge engine. Each statement runs in its own transaction (the SQL
// surface is autocommit); errors abort the transaction and surface to the
// caller with their SQLSTATE.
//
// Lock discipline per isolation level:
//   READ UNCOMMITTED  reads take no locks
//   READ COMMITTED    table IS, row S released right after the read
//   REPEATABLE READ   table IS, row S held to commit
//   SERIALIZABLE      table S for scans (phantom guard), IX + row X writes
// Temporal reads (`AS OF TX n`) touch immutable history and take no locks.

use crate::catalog::{Catalog, TableInfo};
use crate::common::{CommitSeq, Rid};
use crate::crdt::{self, MergeContext, MergePolicy};
use crate::error::{DbError, ErrorContext, Result};
use crate::execution::expressions::{self, eval, is_true, RowSchema};
use crate::parser::ast::{Expr, JoinClause, SelectItem, SelectStatement, Statement};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::table_heap::{TableHeap, UpdateOutcome};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::manager::{TransactionManager, TxnHandle};
use crate::transaction::mvcc::VersionStore;
use crate::transaction::types::{AbortReason, IsolationLevel, LockMode, Transaction};
use crate::transaction::wal::WalManager;
use crate::types::schema::Schema;
use crate::types::tuple::Tuple;
use crate::types::value::{DataType, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tabular statement result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub message: String,
}

impl QueryResult {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct Session {
    pub isolation: IsolationLevel,
    /// Differential-privacy budget accepted via `SET DP_EPSILON`; stored
    /// for the session, not applied by the core engine.
    pub dp_epsilon: f64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::RepeatableRead,
            dp_epsilon: 1.0,
        }
    }
}

/// The statement executor.
pub struct Executor {
    catalog: Arc<Catalog>,
    bp: Arc<BufferPoolManager>,
    wal: Arc<WalManager>,
    txn_mgr: Arc<TransactionManager>,
    lock_mgr: Arc<LockManager>,
    versions: Arc<VersionStore>,
}

impl Executor {
    pub fn new(
        catalog: Arc<Catalog>,
        bp: Arc<BufferPoolManager>,
        wal: Arc<WalManager>,
        txn_mgr: Arc<TransactionManager>,
        lock_mgr: Arc<LockManager>,
        versions: Arc<VersionStore>,
    ) -> Self {
        Self {
            catalog,
            bp,
            wal,
            txn_mgr,
            lock_mgr,
            versions,
        }
    }

    /// Runs one statement in its own transaction.
    pub fn execute(&self, stmt: &Statement, session: &Session) -> Result<QueryResult> {
        let handle = self.txn_mgr.begin(session.isolation)?;
        let result = self.run(stmt, &handle);
        match result {
            Ok(r) => {
                if let Err(e) = self.txn_mgr.commit(&handle) {
                    if let Err(abort_err) = self.txn_mgr.abort(&handle, AbortReason::Error) {
                        tracing::error!("abort failed after commit error: {}", abort_err);
                    }
                    return Err(e);
                }
                Ok(r)
            }
            Err(e) => {
                let reason = match e {
                    DbError::Deadlock => AbortReason::Deadlock,
                    DbError::LockTimeout => AbortReason::LockTimeout,
                    _ => AbortReason::Error,
                };
                if let Err(abort_err) = self.txn_mgr.abort(&handle, reason) {
                    tracing::error!("abort failed after statement error: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn run(&self, stmt: &Statement, handle: &TxnHandle) -> Result<QueryResult> {
        let mut txn = handle.lock();
        match stmt {
            Statement::CreateTable { name, columns } => self.create_table(name, columns.clone()),
            Statement::DropTable { name } => self.drop_table(&mut txn, name),
            Statement::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                self.catalog.create_index(name, table, columns.clone(), *unique)?;
                Ok(QueryResult::message(format!("Index {} created", name)))
            }
            Statement::DropIndex { name } => {
                self.catalog.drop_index(name)?;
                Ok(QueryResult::message(format!("Index {} dropped", name)))
            }
            Statement::Insert {
                table,
                columns,
                rows,
                on_conflict_merge,
                valid_period,
            } => {
                if *valid_period {
                    return Err(DbError::Unsupported(
                        "VALID PERIOD application-time rows".to_string(),
                    ));
                }
                self.insert(&mut txn, table, columns, rows, *on_conflict_merge)
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => self.update(&mut txn, table, assignments, filter.as_ref()),
            Statement::Delete { table, filter } => self.delete(&mut txn, table, filter.as_ref()),
            Statement::Select(select) => self.select(&mut txn, select),
            other => Err(DbError::Internal(format!(
                "statement {:?} must be handled by the engine facade",
                other
            ))),
        }
    }

    fn heap(&self, info: &TableInfo) -> TableHeap {
        TableHeap::new(
            info.oid,
            info.first_page_id,
            self.bp.clone(),
            self.wal.clone(),
        )
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn create_table(&self, name: &str, columns: Vec<crate::types::schema::Column>) -> Result<QueryResult> {
        let mut seen = std::collections::HashSet::new();
        let mut pk_count = 0;
        for column in &columns {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(DbError::Semantic(format!(
                    "duplicate column {}",
                    column.name
                )));
            }
            if column.primary_key {
                pk_count += 1;
            }
            if let Some(policy) = &column.merge_policy {
                Self::check_policy_type(policy, column)?;
            }
        }
        if pk_count > 1 {
            return Err(DbError::Semantic(
                "composite primary keys are not supported".to_string(),
            ));
        }
        let (first_page, _frame) = self.bp.new_page()?;
        self.bp.unpin_page(first_page, true);
        self.catalog
            .create_table(name, Schema::new(columns), first_page)?;
        Ok(QueryResult::message(format!("Table {} created", name)))
    }

    fn check_policy_type(policy: &MergePolicy, column: &crate::types::schema::Column) -> Result<()> {
        let ok = match policy {
            MergePolicy::GSet | MergePolicy::OrSet => {
                matches!(column.data_type, DataType::Set(_))
            }
            MergePolicy::Sum | MergePolicy::SumBounded { .. } => column.data_type.is_numeric(),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(DbError::Semantic(format!(
                "merge policy {} is not valid for column {} ({})",
                policy, column.name, column.data_type
            )))
        }
    }

    fn drop_table(&self, txn: &mut Transaction, name: &str) -> Result<QueryResult> {
        let info = self.catalog.get_table(name)?;
        // Drain concurrent users before the entry disappears.
        self.lock_mgr.lock_table(txn, LockMode::Exclusive, info.oid)?;
        self.catalog.drop_table(name)?;
        self.versions.drop_table(info.oid);
        Ok(QueryResult::message(format!("Table {} dropped", name)))
    }

    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    /// Materializes the visible rows of a table.
    fn scan(
        &self,
        txn: &mut Transaction,
        info: &TableInfo,
        as_of: Option<CommitSeq>,
        for_write: bool,
        collapse: bool,
    ) -> Result<Vec<(Rid, Vec<Value>)>> {
        if as_of.is_none() {
            if for_write {
                self.lock_mgr
                    .lock_table(txn, LockMode::IntentExclusive, info.oid)?;
            } else {
                match txn.isolation {
                    IsolationLevel::ReadUncommitted => {}
                    IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => {
                        self.lock_mgr
                            .lock_table(txn, LockMode::IntentShared, info.oid)?;
                    }
                    IsolationLevel::Serializable => {
                        self.lock_mgr.lock_table(txn, LockMode::Shared, info.oid)?;
                    }
                }
            }
        }
        let lock_rows = as_of.is_none()
            && !for_write
            && matches!(
                txn.isolation,
                IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead
            );

        let mut rows = Vec::new();
        for rid in self.versions.table_rids(info.oid) {
            if lock_rows {
                self.lock_mgr
                    .lock_row(txn, LockMode::Shared, info.oid, rid)?;
            }
            let visible = self.versions.read_visible(info.oid, rid, txn.id, as_of);
            if lock_rows && txn.isolation == IsolationLevel::ReadCommitted {
                self.lock_mgr.unlock_row_shared(txn, info.oid, rid);
            }
            let Some(bytes) = visible else { continue };
            let tuple = Tuple::decode(&bytes, &info.schema)?;
            let mut values = tuple.values;
            if collapse {
                for (i, column) in info.schema.columns().iter().enumerate() {
                    if let Some(policy) = &column.merge_policy {
                        values[i] = crdt::read_value(policy, &values[i]);
                    }
                }
            }
            rows.push((rid, values));
        }
        Ok(rows)
    }

    fn row_schema(info: &TableInfo, alias: Option<&str>) -> RowSchema {
        let qualifier = alias.unwrap_or(&info.name);
        RowSchema::from_names(
            Some(qualifier),
            info.schema.columns().iter().map(|c| c.name.as_str()),
        )
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn select(&self, txn: &mut Transaction, select: &SelectStatement) -> Result<QueryResult> {
        let info = self.catalog.get_table(&select.table)?;
        let as_of = select.as_of_tx;
        let base_rows = self.scan(txn, &info, as_of, false, true)?;
        let mut schema = Self::row_schema(&info, select.table_alias.as_deref());
        let mut rows: Vec<Vec<Value>> = base_rows.into_iter().map(|(_, v)| v).collect();

        if let Some(join) = &select.join {
            (rows, schema) = self.join(txn, rows, &schema, join, as_of)?;
        }

        if let Some(filter) = &select.filter {
            let mut kept = Vec::new();
            for row in rows {
                if is_true(&eval(filter, &row, &schema)?) {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        let has_aggregates = !select.group_by.is_empty()
            || select.projection.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => expr.has_aggregate(),
                SelectItem::Star => false,
            });

        let (headers, mut output) = if has_aggregates {
            if !select.order_by.is_empty() {
                return Err(DbError::Unsupported(
                    "ORDER BY with aggregates".to_string(),
                ));
            }
            self.aggregate(select, &rows, &schema)?
        } else {
            let mut headers = Vec::new();
            for item in &select.projection {
                match item {
                    SelectItem::Star => {
                        headers.extend(schema.columns.iter().map(|(_, n)| n.clone()))
                    }
                    SelectItem::Expr { expr, alias } => {
                        headers.push(alias.clone().unwrap_or_else(|| render_expr(expr)))
                    }
                }
            }
            let mut output = Vec::with_capacity(rows.len());
            if !select.order_by.is_empty() {
                let mut keyed: Vec<(Vec<Value>, Vec<Value>)> = Vec::with_capacity(rows.len());
                for row in &rows {
                    let mut key = Vec::with_capacity(select.order_by.len());
                    for (expr, _) in &select.order_by {
                        key.push(eval(expr, row, &schema)?);
                    }
                    keyed.push((key, row.clone()));
                }
                keyed.sort_by(|(a, _), (b, _)| {
                    for (i, (_, asc)) in select.order_by.iter().enumerate() {
                        let ord = expressions::compare_values(&a[i], &b[i])
                            .unwrap_or(std::cmp::Ordering::Equal);
                        let ord = if *asc { ord } else { ord.reverse() };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                rows = keyed.into_iter().map(|(_, r)| r).collect();
            }
            for row in &rows {
                let mut out = Vec::new();
                for item in &select.projection {
                    match item {
                        SelectItem::Star => out.extend(row.iter().cloned()),
                        SelectItem::Expr { expr, .. } => out.push(eval(expr, row, &schema)?),
                    }
                }
                output.push(out);
            }
            (headers, output)
        };

        if let Some(limit) = select.limit {
            output.truncate(limit);
        }
        Ok(QueryResult {
            headers,
            message: format!("{} row(s)", output.len()),
            rows: output,
        })
    }

    fn join(
        &self,
        txn: &mut Transaction,
        left_rows: Vec<Vec<Value>>,
        left_schema: &RowSchema,
        join: &JoinClause,
        as_of: Option<CommitSeq>,
    ) -> Result<(Vec<Vec<Value>>, RowSchema)> {
        let info = self.catalog.get_table(&join.table)?;
        let right_rows: Vec<Vec<Value>> = self
            .scan(txn, &info, as_of, false, true)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let right_schema = Self::row_schema(&info, join.alias.as_deref());
        let combined = left_schema.concat(&right_schema);
        let mut rows = Vec::new();
        for l in &left_rows {
            for r in &right_rows {
                let mut row = l.clone();
                row.extend(r.iter().cloned());
                if is_true(&eval(&join.on, &row, &combined)?) {
                    rows.push(row);
                }
            }
        }
        Ok((rows, combined))
    }

    fn aggregate(
        &self,
        select: &SelectStatement,
        rows: &[Vec<Value>],
        schema: &RowSchema,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        // Group rows by the GROUP BY key (sorted, deterministic output).
        let mut groups: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
        if select.group_by.is_empty() {
            groups.insert(Vec::new(), (0..rows.len()).collect());
        } else {
            for (i, row) in rows.iter().enumerate() {
                let mut key = Vec::with_capacity(select.group_by.len());
                for expr in &select.group_by {
                    key.push(eval(expr, row, schema)?);
                }
                groups.entry(key).or_default().push(i);
            }
        }

        let mut headers = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Star => {
                    return Err(DbError::Semantic(
                        "SELECT * cannot be combined with aggregates".to_string(),
                    ))
                }
                SelectItem::Expr { expr, alias } => {
                    headers.push(alias.clone().unwrap_or_else(|| render_expr(expr)))
                }
            }
        }

        let mut output = Vec::new();
        for (key, members) in &groups {
            let mut out = Vec::new();
            for item in &select.projection {
                let SelectItem::Expr { expr, .. } = item else {
                    unreachable!()
                };
                if expr.has_aggregate() {
                    out.push(self.eval_aggregate(expr, members, rows, schema)?);
                } else {
                    // Non-aggregate projections must be grouping keys.
                    let position = select.group_by.iter().position(|g| g == expr);
                    match position {
                        Some(i) => out.push(key[i].clone()),
                        None => {
                            return Err(DbError::Semantic(format!(
                                "{} must appear in GROUP BY",
                                render_expr(expr)
                            )))
                        }
                    }
                }
            }
            output.push(out);
        }
        Ok((headers, output))
    }

    fn eval_aggregate(
        &self,
        expr: &Expr,
        members: &[usize],
        rows: &[Vec<Value>],
        schema: &RowSchema,
    ) -> Result<Value> {
        let Expr::Function { name, args, star } = expr else {
            return Err(DbError::Semantic(format!(
                "{} mixes aggregates with row expressions",
                render_expr(expr)
            )));
        };
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "count" if *star => Ok(Value::BigInt(members.len() as i64)),
            "count" => {
                let arg = Self::single_arg(name, args)?;
                let mut n = 0i64;
                for &i in members {
                    if !eval(arg, &rows[i], schema)?.is_null() {
                        n += 1;
                    }
                }
                Ok(Value::BigInt(n))
            }
            "sum" | "avg" => {
                let arg = Self::single_arg(name, args)?;
                let mut sum = 0.0f64;
                let mut int_sum = 0i64;
                let mut all_int = true;
                let mut n = 0u64;
                for &i in members {
                    let v = eval(arg, &rows[i], schema)?;
                    if v.is_null() {
                        continue;
                    }
                    match v.as_i64() {
                        Some(x) if all_int => {
                            int_sum = int_sum
                                .checked_add(x)
                                .ok_or_else(|| DbError::DataType("SUM overflow".to_string()))?;
                        }
                        _ => {
                            let x = v.as_f64().ok_or_else(|| {
                                DbError::DataType(format!("{} requires numerics", name))
                            })?;
                            if all_int {
                                sum = int_sum as f64;
                                all_int = false;
                            }
                            sum += x;
                        }
                    }
                    n += 1;
                }
                if n == 0 {
                    return Ok(Value::Null);
                }
                if lower == "avg" {
                    let total = if all_int { int_sum as f64 } else { sum };
                    return Ok(Value::Double(total / n as f64));
                }
                Ok(if all_int {
                    Value::BigInt(int_sum)
                } else {
                    Value::Double(sum)
                })
            }
            "min" | "max" => {
                let arg = Self::single_arg(name, args)?;
                let mut best: Option<Value> = None;
                for &i in members {
                    let v = eval(arg, &rows[i], schema)?;
                    if v.is_null() {
                        continue;
                    }
                    best = Some(match best {
                        None => v,
                        Some(b) => {
                            let ord = expressions::compare_values(&v, &b)?;
                            let take = if lower == "min" {
                                ord == std::cmp::Ordering::Less
                            } else {
                                ord == std::cmp::Ordering::Greater
                            };
                            if take {
                                v
                            } else {
                                b
                            }
                        }
                    });
                }
                Ok(best.unwrap_or(Value::Null))
            }
            other => Err(DbError::Semantic(format!("unknown aggregate {}", other))),
        }
    }

    fn single_arg<'a>(name: &str, args: &'a [Expr]) -> Result<&'a Expr> {
        match args {
            [one] => Ok(one),
            _ => Err(DbError::Semantic(format!("{} takes one argument", name))),
        }
    }

    // ------------------------------------------------------------------
    // INSERT (with CRDT merge on primary-key conflicts)
    // ------------------------------------------------------------------

    fn insert(
        &self,
        txn: &mut Transaction,
        table: &str,
        columns: &[String],
        rows: &[Vec<Expr>],
        on_conflict_merge: bool,
    ) -> Result<QueryResult> {
        let info = self.catalog.get_table(table)?;
        self.lock_mgr
            .lock_table(txn, LockMode::IntentExclusive, info.oid)?;
        let heap = self.heap(&info);
        let schema = &info.schema;

        // Map provided column names (or positional order) to indices.
        let provided: Vec<usize> = if columns.is_empty() {
            (0..schema.len()).collect()
        } else {
            columns
                .iter()
                .map(|name| {
                    schema.index_of(name).ok_or_else(|| {
                        DbError::NotFound(format!("column {} in table {}", name, table))
                    })
                })
                .collect::<Result<_>>()?
        };

        let empty_schema = RowSchema::default();
        let mut inserted = 0usize;
        let mut merged = 0usize;
        for row_exprs in rows {
            if row_exprs.len() != provided.len() {
                return Err(DbError::Semantic(format!(
                    "expected {} values, got {}",
                    provided.len(),
                    row_exprs.len()
                )));
            }
            let stamp = self.txn_mgr.current_commit_seq() + 1;
            let mut values = vec![Value::Null; schema.len()];
            let mut supplied = vec![false; schema.len()];
            for (expr, &idx) in row_exprs.iter().zip(&provided) {
                let mut v = eval(expr, &[], &empty_schema)?;
                if let Some(policy) = &schema.column(idx).unwrap().merge_policy {
                    let base = if matches!(policy, MergePolicy::GSet | MergePolicy::OrSet)
                        && !v.is_null()
                    {
                        v.coerce_to(&schema.column(idx).unwrap().data_type)?
                    } else {
                        v.clone()
                    };
                    v = crdt::prepare_insert(policy, &base, stamp)?;
                }
                values[idx] = v;
                supplied[idx] = true;
            }

            // Primary-key conflict detection.
            let conflict = match schema.primary_key_index() {
                Some(pk) if !values[pk].is_null() => {
                    let pk_value = values[pk].coerce_to(&schema.column(pk).unwrap().data_type)?;
                    self.find_by_pk(txn, &info, pk, &pk_value)?
                }
                _ => None,
            };

            match conflict {
                Some((rid, existing)) => {
                    if !on_conflict_merge {
                        let column = schema.column(schema.primary_key_index().unwrap()).unwrap();
                        return Err(DbError::UniqueViolation(format!(
                            "duplicate key {} in table {}",
                            values[schema.primary_key_index().unwrap()], table
                        ))
                        .with_context(ErrorContext {
                            table: Some(table.to_string()),
                            column: Some(column.name.clone()),
                            constraint: Some("primary key".to_string()),
                            ..Default::default()
                        }));
                    }
                    self.merge_into(txn, &info, &heap, rid, existing, &values, &supplied, stamp)?;
                    merged += 1;
                }
                None => {
                    let tuple = Tuple::new(values);
                    let bytes = tuple.encode(schema)?;
                    let rid = heap.insert_tuple(txn, &bytes)?;
                    self.lock_mgr
                        .lock_row(txn, LockMode::Exclusive, info.oid, rid)?;
                    self.versions.append(info.oid, rid, Some(bytes), txn.id);
                    txn.record_write(info.oid, rid);
                    inserted += 1;
                }
            }
        }
        let message = if merged > 0 {
            format!("{} row(s) inserted, {} merged", inserted, merged)
        } else {
            format!("{} row(s) inserted", inserted)
        };
        Ok(QueryResult::message(message))
    }

    /// Current visible row with the given primary-key value.
    fn find_by_pk(
        &self,
        txn: &Transaction,
        info: &TableInfo,
        pk: usize,
        pk_value: &Value,
    ) -> Result<Option<(Rid, Vec<Value>)>> {
        for rid in self.versions.table_rids(info.oid) {
            let Some(bytes) = self.versions.read_visible(info.oid, rid, txn.id, None) else {
                continue;
            };
            let tuple = Tuple::decode(&bytes, &info.schema)?;
            if expressions::compare_values(&tuple.values[pk], pk_value)
                .map(|o| o == std::cmp::Ordering::Equal)
                .unwrap_or(false)
            {
                return Ok(Some((rid, tuple.values)));
            }
        }
        Ok(None)
    }

    /// CRDT merge of an incoming row into the existing one. Columns absent
    /// from the INSERT are identity; provided columns dispatch on their
    /// declared policy, defaulting to commit-sequence LWW.
    #[allow(clippy::too_many_arguments)]
    fn merge_into(
        &self,
        txn: &mut Transaction,
        info: &TableInfo,
        heap: &TableHeap,
        rid: Rid,
        existing: Vec<Value>,
        incoming: &[Value],
        supplied: &[bool],
        stamp: CommitSeq,
    ) -> Result<QueryResult> {
        self.lock_mgr
            .lock_row(txn, LockMode::Exclusive, info.oid, rid)?;
        let (existing_stamp, existing_txn) = self
            .versions
            .latest_commit_info(info.oid, rid)
            .unwrap_or((0, 0));
        let ctx = MergeContext {
            existing_stamp,
            incoming_stamp: stamp,
            existing_txn,
            incoming_txn: txn.id,
            site_id: 0,
        };
        let mut merged = Vec::with_capacity(existing.len());
        for (i, column) in info.schema.columns().iter().enumerate() {
            if !supplied[i] {
                merged.push(existing[i].clone());
                continue;
            }
            let policy = column.merge_policy.clone().unwrap_or(MergePolicy::Lww);
            merged.push(crdt::merge(&policy, &existing[i], &incoming[i], &ctx)?);
        }
        let tuple = Tuple::new(merged);
        let bytes = tuple.encode(&info.schema)?;
        match heap.update_tuple(txn, rid, &bytes)? {
            UpdateOutcome::InPlace => {
                self.versions.append(info.oid, rid, Some(bytes), txn.id);
                txn.record_write(info.oid, rid);
            }
            UpdateOutcome::Moved(new_rid) => {
                self.lock_mgr
                    .lock_row(txn, LockMode::Exclusive, info.oid, new_rid)?;
                self.versions.append(info.oid, rid, None, txn.id);
                self.versions.append(info.oid, new_rid, Some(bytes), txn.id);
                txn.record_write(info.oid, rid);
                txn.record_write(info.oid, new_rid);
            }
        }
        Ok(QueryResult::message("merged"))
    }

    // ------------------------------------------------------------------
    // UPDATE / DELETE
    // ------------------------------------------------------------------

    fn update(
        &self,
        txn: &mut Transaction,
        table: &str,
        assignments: &[(String, Expr)],
        filter: Option<&Expr>,
    ) -> Result<QueryResult> {
        let info = self.catalog.get_table(table)?;
        let schema = Self::row_schema(&info, None);
        let targets: Vec<(usize, &Expr)> = assignments
            .iter()
            .map(|(name, expr)| {
                info.schema
                    .index_of(name)
                    .map(|i| (i, expr))
                    .ok_or_else(|| {
                        DbError::NotFound(format!("column {} in table {}", name, table))
                    })
            })
            .collect::<Result<_>>()?;

        let heap = self.heap(&info);
        let candidates = self.scan(txn, &info, None, true, false)?;
        let mut updated = 0usize;
        for (rid, values) in candidates {
            if let Some(filter) = filter {
                if !is_true(&eval(filter, &values, &schema)?) {
                    continue;
                }
            }
            self.lock_mgr
                .lock_row(txn, LockMode::Exclusive, info.oid, rid)?;
            // Re-read under the lock: a concurrent writer may have committed
            // between the scan and the grant.
            let Some(bytes) = self.versions.read_visible(info.oid, rid, txn.id, None) else {
                continue;
            };
            let values = Tuple::decode(&bytes, &info.schema)?.values;
            if let Some(filter) = filter {
                if !is_true(&eval(filter, &values, &schema)?) {
                    continue;
                }
            }
            let mut new_values = values.clone();
            for (idx, expr) in &targets {
                let mut v = eval(expr, &values, &schema)?;
                if let Some(policy) = &info.schema.column(*idx).unwrap().merge_policy {
                    let stamp = self.txn_mgr.current_commit_seq() + 1;
                    if matches!(policy, MergePolicy::GSet | MergePolicy::OrSet) && !v.is_null() {
                        v = v.coerce_to(&info.schema.column(*idx).unwrap().data_type)?;
                    }
                    v = crdt::prepare_insert(policy, &v, stamp)?;
                }
                new_values[*idx] = v;
            }
            let bytes = Tuple::new(new_values).encode(&info.schema)?;
            match heap.update_tuple(txn, rid, &bytes)? {
                UpdateOutcome::InPlace => {
                    self.versions.append(info.oid, rid, Some(bytes), txn.id);
                    txn.record_write(info.oid, rid);
                }
                UpdateOutcome::Moved(new_rid) => {
                    self.lock_mgr
                        .lock_row(txn, LockMode::Exclusive, info.oid, new_rid)?;
                    self.versions.append(info.oid, rid, None, txn.id);
                    self.versions.append(info.oid, new_rid, Some(bytes), txn.id);
                    txn.record_write(info.oid, rid);
                    txn.record_write(info.oid, new_rid);
                }
            }
            updated += 1;
        }
        Ok(QueryResult::message(format!("{} row(s) updated", updated)))
    }

    fn delete(
        &self,
        txn: &mut Transaction,
        table: &str,
        filter: Option<&Expr>,
    ) -> Result<QueryResult> {
        let info = self.catalog.get_table(table)?;
        let schema = Self::row_schema(&info, None);
        let heap = self.heap(&info);
        let candidates = self.scan(txn, &info, None, true, false)?;
        let mut deleted = 0usize;
        for (rid, values) in candidates {
            if let Some(filter) = filter {
                if !is_true(&eval(filter, &values, &schema)?) {
                    continue;
                }
            }
            self.lock_mgr
                .lock_row(txn, LockMode::Exclusive, info.oid, rid)?;
            let Some(bytes) = self.versions.read_visible(info.oid, rid, txn.id, None) else {
                continue;
            };
            if let Some(filter) = filter {
                let values = Tuple::decode(&bytes, &info.schema)?.values;
                if !is_true(&eval(filter, &values, &schema)?) {
                    continue;
                }
            }
            heap.delete_tuple(txn, rid)?;
            self.versions.append(info.oid, rid, None, txn.id);
            txn.record_write(info.oid, rid);
            deleted += 1;
        }
        Ok(QueryResult::message(format!("{} row(s) deleted", deleted)))
    }
}

/// Human-readable header for an unaliased projection.
fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Column(Some(q), name) => format!("{}.{}", q, name),
        Expr::Column(None, name) => name.clone(),
        Expr::Function { name, args, star } => {
            if *star {
                format!("{}(*)", name.to_ascii_lowercase())
            } else {
                format!(
                    "{}({})",
                    name.to_ascii_lowercase(),
                    args.iter().map(render_expr).collect::<Vec<_>>().join(", ")
                )
            }
        }
        Expr::Literal(v) => v.to_string(),
        _ => "expr".to_string(),
    }
}
