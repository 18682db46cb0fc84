use pfg_models::Entry;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn escape_href(s: &str) -> String {
    s.replace('%', "%25")
        .replace('#', "%23")
        .replace('?', "%3F")
        .replace('"', "%22")
}

fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Folder listing page. Carries the cursor it was rendered at so the page
/// can long-poll `/subscribe/{cursor}` and reload itself on changes.
pub(crate) fn folder_page(
    root: &str,
    path: &str,
    entries: &[(String, Entry)],
    cursor: &str,
) -> String {
    let base = if path.is_empty() {
        format!("{}/", root.trim_end_matches('/'))
    } else {
        format!("{}/{}/", root.trim_end_matches('/'), path.trim_matches('/'))
    };
    let title = escape_html(&base);

    let mut rows = String::new();
    if !path.is_empty() {
        rows.push_str("<tr><td><a href=\"..\">..</a></td><td></td></tr>\n");
    }
    for (name, entry) in entries {
        let href = escape_href(&format!("{}{}", base, name));
        match entry {
            Entry::Folder(_) => {
                rows.push_str(&format!(
                    "<tr><td><a href=\"{}/\">{}/</a></td><td></td></tr>\n",
                    href,
                    escape_html(name)
                ));
            }
            Entry::File(meta) => {
                rows.push_str(&format!(
                    "<tr><td><a href=\"{}\">{}</a></td><td>{}</td></tr>\n",
                    href,
                    escape_html(name),
                    meta.size
                ));
            }
        }
    }

    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body>\n<h1>{title}</h1>\n<table>\n{rows}</table>\n\
         <script>\n\
         async function watch(cursor) {{\n\
           try {{\n\
             const resp = await fetch('/subscribe/' + encodeURIComponent(cursor));\n\
             const body = await resp.json();\n\
             if (body.result === 'refresh') {{ location.reload(); }} else {{ watch(cursor); }}\n\
           }} catch (e) {{\n\
             setTimeout(() => watch(cursor), 5000);\n\
           }}\n\
         }}\n\
         watch('{cursor}');\n\
         </script>\n</body>\n</html>\n",
        title = title,
        rows = rows,
        cursor = escape_js(cursor),
    )
}
