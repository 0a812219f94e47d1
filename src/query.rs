use crate::models::CatalogEntry;

/// Resolves the marketplace query for an entry: the manual override
/// wins, otherwise the imported auto-generated query. Resolved once per
/// entry per run and not re-evaluated mid-run.
pub fn resolve_query(entry: &CatalogEntry) -> Option<&str> {
    non_blank(entry.query_override.as_deref()).or_else(|| non_blank(entry.query.as_deref()))
}

fn non_blank(q: Option<&str>) -> Option<&str> {
    q.map(str::trim).filter(|q| !q.is_empty())
}

/// Builds the default marketplace query from the entry's identity:
/// name, collector number, segment name. Used by import collaborators
/// and when recomputing a single entry whose query was never generated.
pub fn build_query(entry: &CatalogEntry) -> String {
    let mut parts = vec![entry.name.trim()];
    if let Some(number) = entry.number.as_deref() {
        let number = number.trim();
        if !number.is_empty() {
            parts.push(number);
        }
    }
    let segment_name = entry.segment_name.trim();
    if !segment_name.is_empty() {
        parts.push(segment_name);
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            id: 9,
            catalog_key: "sv08-25".into(),
            name: "Pikachu ex".into(),
            segment: "sv08".into(),
            segment_name: "Etincelles Deferlantes".into(),
            number: Some("57/191".into()),
            query: Some("Pikachu ex 57/191 Etincelles Deferlantes".into()),
            query_override: None,
            ref_trend: None,
            ref_avg7: None,
            ref_avg30: None,
            active: true,
            last_error_at: None,
            last_priced_at: None,
        }
    }

    #[test]
    fn override_wins_over_generated() {
        let mut e = entry();
        assert_eq!(resolve_query(&e), e.query.as_deref());
        e.query_override = Some("pikachu ex 57 EV08".into());
        assert_eq!(resolve_query(&e), Some("pikachu ex 57 EV08"));
    }

    #[test]
    fn blank_override_falls_back_to_generated() {
        let mut e = entry();
        e.query_override = Some("   ".into());
        assert_eq!(resolve_query(&e), e.query.as_deref());
        e.query = None;
        assert_eq!(resolve_query(&e), None);
    }

    #[test]
    fn build_query_composes_identity() {
        let e = entry();
        assert_eq!(build_query(&e), "Pikachu ex 57/191 Etincelles Deferlantes");
    }
}
