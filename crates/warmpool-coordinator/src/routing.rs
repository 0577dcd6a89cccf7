//! Request routing between running configurations.

/// Pick the running configuration that should serve `requested`.
///
/// `running` must be sorted. With no request the first name wins. Otherwise
/// the greatest name that is `<=` the request is chosen (so an exact match
/// wins), falling back to the first name when every running name sorts after
/// the request. Names compare as plain strings: `"v10"` sorts before `"v9"`.
pub fn best_match<'a>(running: &'a [String], requested: Option<&str>) -> Option<&'a str> {
    let first = running.first()?;
    let Some(requested) = requested else {
        return Some(first);
    };

    let mut best = first;
    for name in running {
        if requested < name.as_str() {
            break;
        }
        best = name;
    }
    Some(best)
}
