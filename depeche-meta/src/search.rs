use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// Search criteria, protocol-agnostic. The IMAP layer translates SEARCH
/// keys into this tree; sequence-number constraints are resolved to UID
/// ranges by the session tracker before they get here.
#[derive(Clone, Debug)]
pub enum Criterion {
    All,
    UidIn(Vec<(u32, u32)>),
    FlagSet(i32),
    FlagClear(i32),
    Keyword(String),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Larger(u64),
    Smaller(u64),
    Subject(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    /// Body text, from the plaintext extraction.
    Body(String),
    /// Subject or body text.
    Text(String),
    And(Vec<Criterion>),
    Or(Box<Criterion>, Box<Criterion>),
    Not(Box<Criterion>),
}

/// Owned SQL parameter values for dynamically built queries.
#[derive(Debug)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Int(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Accumulates `$n` placeholders. Starts counting after the fixed leading
/// parameters of the final statement (mailbox id is `$1`).
pub struct SqlParams {
    pub values: Vec<SqlValue>,
    offset: usize,
}

impl SqlParams {
    pub fn new(offset: usize) -> Self {
        Self {
            values: Vec::new(),
            offset,
        }
    }

    fn push(&mut self, v: SqlValue) -> String {
        self.values.push(v);
        format!("${}", self.offset + self.values.len())
    }
}

impl Criterion {
    /// Render as a WHERE fragment over the `m` (messages) alias. Address
    /// criteria go through EXISTS probes on `message_recipients`.
    pub fn to_sql(&self, p: &mut SqlParams) -> String {
        match self {
            Criterion::All => "TRUE".into(),
            Criterion::UidIn(ranges) => {
                if ranges.is_empty() {
                    return "FALSE".into();
                }
                let parts: Vec<String> = ranges
                    .iter()
                    .map(|(lo, hi)| {
                        let plo = p.push(SqlValue::Int(*lo as i64));
                        let phi = p.push(SqlValue::Int(*hi as i64));
                        format!("(m.uid BETWEEN {} AND {})", plo, phi)
                    })
                    .collect();
                format!("({})", parts.join(" OR "))
            }
            Criterion::FlagSet(bit) => {
                let pb = p.push(SqlValue::Int(*bit as i64));
                format!("(m.flag_bits & {} <> 0)", pb)
            }
            Criterion::FlagClear(bit) => {
                let pb = p.push(SqlValue::Int(*bit as i64));
                format!("(m.flag_bits & {} = 0)", pb)
            }
            Criterion::Keyword(kw) => {
                let pk = p.push(SqlValue::Text(kw.clone()));
                format!(
                    "EXISTS (SELECT 1 FROM unnest(m.custom_flags) kf WHERE lower(kf) = lower({}))",
                    pk
                )
            }
            Criterion::Before(d) => {
                let pd = p.push(SqlValue::Timestamp(midnight(*d)));
                format!("(m.internal_date < {})", pd)
            }
            Criterion::On(d) => {
                let lo = p.push(SqlValue::Timestamp(midnight(*d)));
                let hi = p.push(SqlValue::Timestamp(midnight(next_day(*d))));
                format!("(m.internal_date >= {} AND m.internal_date < {})", lo, hi)
            }
            Criterion::Since(d) => {
                let pd = p.push(SqlValue::Timestamp(midnight(*d)));
                format!("(m.internal_date >= {})", pd)
            }
            Criterion::SentBefore(d) => {
                let pd = p.push(SqlValue::Timestamp(midnight(*d)));
                format!("(m.sent_date < {})", pd)
            }
            Criterion::SentOn(d) => {
                let lo = p.push(SqlValue::Timestamp(midnight(*d)));
                let hi = p.push(SqlValue::Timestamp(midnight(next_day(*d))));
                format!("(m.sent_date >= {} AND m.sent_date < {})", lo, hi)
            }
            Criterion::SentSince(d) => {
                let pd = p.push(SqlValue::Timestamp(midnight(*d)));
                format!("(m.sent_date >= {})", pd)
            }
            Criterion::Larger(n) => {
                let pn = p.push(SqlValue::Int(*n as i64));
                format!("(m.size > {})", pn)
            }
            Criterion::Smaller(n) => {
                let pn = p.push(SqlValue::Int(*n as i64));
                format!("(m.size < {})", pn)
            }
            Criterion::Subject(s) => {
                let ps = p.push(SqlValue::Text(contains(s)));
                format!("(m.subject ILIKE {})", ps)
            }
            Criterion::From(s) => recipient_probe(0, s, p),
            Criterion::To(s) => recipient_probe(1, s, p),
            Criterion::Cc(s) => recipient_probe(2, s, p),
            Criterion::Bcc(s) => recipient_probe(3, s, p),
            Criterion::Body(s) => {
                let ps = p.push(SqlValue::Text(contains(s)));
                format!("(m.plaintext_body ILIKE {})", ps)
            }
            Criterion::Text(s) => {
                let p1 = p.push(SqlValue::Text(contains(s)));
                let p2 = p.push(SqlValue::Text(contains(s)));
                format!("(m.subject ILIKE {} OR m.plaintext_body ILIKE {})", p1, p2)
            }
            Criterion::And(list) => {
                if list.is_empty() {
                    return "TRUE".into();
                }
                let parts: Vec<String> = list.iter().map(|c| c.to_sql(p)).collect();
                format!("({})", parts.join(" AND "))
            }
            Criterion::Or(a, b) => format!("({} OR {})", a.to_sql(p), b.to_sql(p)),
            Criterion::Not(inner) => format!("(NOT {})", inner.to_sql(p)),
        }
    }
}

fn recipient_probe(kind: i16, needle: &str, p: &mut SqlParams) -> String {
    let pk = p.push(SqlValue::Int(kind as i64));
    let pn = p.push(SqlValue::Text(contains(needle)));
    format!(
        "EXISTS (SELECT 1 FROM message_recipients r WHERE r.message_id = m.message_id \
         AND r.kind = {} AND (r.address ILIKE {} OR r.display_name ILIKE {}))",
        pk,
        pn,
        // same pattern twice, pushed once more to keep placeholders distinct
        p.push(SqlValue::Text(contains(needle)))
    )
}

fn contains(needle: &str) -> String {
    format!("%{}%", needle.replace('%', "\\%").replace('_', "\\_"))
}

fn midnight(d: NaiveDate) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc)
}

fn next_day(d: NaiveDate) -> NaiveDate {
    d.succ_opt().unwrap_or(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_sequential() {
        let crit = Criterion::And(vec![
            Criterion::FlagClear(1),
            Criterion::Subject("invoice".into()),
            Criterion::Or(
                Box::new(Criterion::Larger(1024)),
                Box::new(Criterion::Text("urgent".into())),
            ),
        ]);
        let mut p = SqlParams::new(1);
        let sql = crit.to_sql(&mut p);

        assert_eq!(
            sql,
            "((m.flag_bits & $2 = 0) AND (m.subject ILIKE $3) AND \
             ((m.size > $4) OR (m.subject ILIKE $5 OR m.plaintext_body ILIKE $6)))"
        );
        assert_eq!(p.values.len(), 5);
    }

    #[test]
    fn uid_ranges() {
        let crit = Criterion::UidIn(vec![(1, 10), (42, 42)]);
        let mut p = SqlParams::new(1);
        let sql = crit.to_sql(&mut p);
        assert_eq!(
            sql,
            "((m.uid BETWEEN $2 AND $3) OR (m.uid BETWEEN $4 AND $5))"
        );
        assert_eq!(p.values.len(), 4);
    }

    #[test]
    fn empty_uid_set_matches_nothing() {
        let mut p = SqlParams::new(1);
        assert_eq!(Criterion::UidIn(vec![]).to_sql(&mut p), "FALSE");
    }

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(contains("100%_sure"), "%100\\%\\_sure%");
    }
}
