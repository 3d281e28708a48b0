use super::SchoolOption;

const STORED_URL_SCORE: i32 = 1000;
const DOMAIN_MATCH_SCORE: i32 = 500;
const GENERIC_OPTION_SCORE: i32 = 100;

/// Label fragments that mark an entry point not tied to one municipality.
const GENERIC_MARKERS: &[&str] = &["ovrigt", "other", "general", "allman"];

/// Trailing words dropped from a domain token before matching.
const DOMAIN_SUFFIXES: &[&str] = &["stad", "kommun", "skola", "skolor"];

/// Signals available when picking a login target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchoolHints {
    /// Login URL that succeeded on a previous run.
    pub stored_url: Option<String>,
    /// Label of the stored choice. Carried for logging only; it never
    /// affects scoring.
    pub stored_label: Option<String>,
    /// Raw hint, typically the username (`parent@goteborg.se`).
    pub domain_hint: Option<String>,
}

/// Result of [`choose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolSelection {
    pub chosen: SchoolOption,
    /// Every option with its score, sorted descending, ties in input order.
    pub scored: Vec<(SchoolOption, i32)>,
}

/// Picks the best login target.
///
/// A stored URL that matches an option always wins. Otherwise a domain hint
/// matching the label earns a large bonus, and a generic entry point
/// outranks municipality-specific ones. Ties keep input order.
///
/// Returns `None` only when `options` is empty.
pub fn choose(options: &[SchoolOption], hints: &SchoolHints) -> Option<SchoolSelection> {
    let stored_url = hints.stored_url.as_deref().map(str::trim).filter(|u| !u.is_empty());
    let stored_match = stored_url.filter(|url| options.iter().any(|o| o.login_url == *url));
    let domain_token = hints.domain_hint.as_deref().and_then(normalize_domain_hint);

    let mut scored: Vec<(SchoolOption, i32)> = options
        .iter()
        .map(|option| {
            let score = match (stored_match, &domain_token) {
                (Some(url), _) if option.login_url == url => STORED_URL_SCORE,
                (Some(_), _) => score_heuristics(option, None),
                (None, token) => score_heuristics(option, token.as_deref()),
            };
            (option.clone(), score)
        })
        .collect();

    // `sort_by` is stable, so equal scores keep their input order.
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let chosen = scored.first()?.0.clone();
    tracing::debug!(
        chosen = %chosen.label,
        stored_label = hints.stored_label.as_deref().unwrap_or(""),
        candidates = scored.len(),
        "Selected school login target"
    );
    Some(SchoolSelection { chosen, scored })
}

fn score_heuristics(option: &SchoolOption, domain_token: Option<&str>) -> i32 {
    let label = fold(&option.label);
    let mut score = 0;
    if let Some(token) = domain_token {
        if label.contains(token) {
            score += DOMAIN_MATCH_SCORE;
        }
    }
    if is_generic(&label) {
        score += GENERIC_OPTION_SCORE;
    }
    score
}

fn is_generic(folded_label: &str) -> bool {
    GENERIC_MARKERS.iter().any(|marker| folded_label.contains(marker))
}

/// Lower-cases and folds Swedish diacritics so `Göteborg` matches `goteborg`.
fn fold(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'å' | 'ä' | 'á' | 'à' => 'a',
            'ö' | 'ø' | 'ó' => 'o',
            'é' | 'è' => 'e',
            'ü' => 'u',
            other => other,
        })
        .collect()
}

/// Reduces a username or domain to the municipality token used for matching.
///
/// `parent@mail.goteborg.se` becomes `goteborg`; `avestakommun.se` becomes
/// `avesta`. Tokens shorter than three characters are discarded.
pub fn normalize_domain_hint(hint: &str) -> Option<String> {
    let domain = hint.rsplit_once('@').map_or(hint, |(_, domain)| domain);
    let domain = fold(domain.trim());

    let mut labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() > 1 {
        labels.pop();
    }
    let mut token = labels.last()?.to_string();

    for suffix in DOMAIN_SUFFIXES {
        if token.len() > suffix.len() + 2 {
            if let Some(stripped) = token.strip_suffix(suffix) {
                token = stripped.trim_end_matches('-').to_string();
                break;
            }
        }
    }

    (token.chars().count() >= 3).then_some(token)
}

/// Domain hint for a username. Only email-style usernames carry one.
pub fn domain_hint_from_username(username: &str) -> Option<String> {
    username.contains('@').then(|| username.to_string())
}
