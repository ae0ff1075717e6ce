//! Server-rendered HTML pages of the authorization flows: login,
//! consent, namespace selection, registration, verifications and the
//! error/logout/failure pages.

use http::StatusCode;

/// Minimal HTML escaping for user-influenced values
pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

const STYLES: &str = r#"
body { font-family: -apple-system, "Segoe UI", Roboto, sans-serif; max-width: 420px;
       margin: 60px auto; padding: 0 20px; color: #222; }
h2 { margin-bottom: 8px; }
.hint { color: #666; font-size: 0.9em; margin-bottom: 20px; }
.form-group { margin-bottom: 14px; }
label { display: block; margin-bottom: 4px; font-size: 0.9em; }
input, select { width: 100%; padding: 8px; border: 1px solid #ccc; border-radius: 4px;
                box-sizing: border-box; }
button { background: #1460aa; color: white; padding: 10px 18px; border: none;
         border-radius: 4px; cursor: pointer; margin-right: 8px; }
button.secondary { background: #888; }
.error { background: #fdecea; color: #b3261e; padding: 10px; border-radius: 4px;
         margin-bottom: 14px; }
.scopes { background: #f4f6f8; padding: 12px; border-radius: 4px; margin: 12px 0; }
.scopes li { margin: 4px 0; }
table { width: 100%; border-collapse: collapse; }
td, th { text-align: left; padding: 6px 4px; border-bottom: 1px solid #eee; }
"#;

/// Shared page wrapper
fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>{STYLES}</style>
</head>
<body>
{body}
</body>
</html>"#,
        title = escape(title),
    )
}

fn error_fragment(error: Option<&str>) -> String {
    match error {
        Some(message) => format!(r#"<div class="error">{}</div>"#, escape(message)),
        None => String::new(),
    }
}

/// Login form; posts back to the method's `/login`
pub fn login_page(action: &str, csrf_token: &str, error: Option<&str>) -> String {
    let body = format!(
        r#"<h2>Sign in</h2>
<p class="hint">Sign in to continue to the application.</p>
{error}
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <div class="form-group">
    <label for="username">Email</label>
    <input type="text" id="username" name="username" required autofocus>
  </div>
  <div class="form-group">
    <label for="password">Password</label>
    <input type="password" id="password" name="password" required>
  </div>
  <button type="submit">Sign in</button>
</form>
<p class="hint"><a href="forgotpassword">Forgot your password?</a></p>"#,
        error = error_fragment(error),
        action = escape(action),
        csrf = escape(csrf_token),
    );
    page("Sign in", &body)
}

/// Scope consent form; lists the scopes the application is missing
pub fn consent_page(
    action: &str,
    csrf_token: &str,
    application: &str,
    api: &str,
    missing_scopes: &[String],
) -> String {
    let scopes: String = missing_scopes
        .iter()
        .map(|s| format!("<li>{}</li>", escape(s)))
        .collect();
    let body = format!(
        r#"<h2>Grant access</h2>
<p class="hint">The application <strong>{application}</strong> requests access to
<strong>{api}</strong> with the following permissions:</p>
<div class="scopes"><ul>{scopes}</ul></div>
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <button type="submit" name="action" value="allow">Allow</button>
  <button type="submit" name="action" value="deny" class="secondary">Deny</button>
</form>"#,
        application = escape(application),
        api = escape(api),
        action = escape(action),
        csrf = escape(csrf_token),
    );
    page("Grant access", &body)
}

/// Namespace selection form for pools with multiple registrations
pub fn select_namespace_page(action: &str, csrf_token: &str, namespaces: &[String]) -> String {
    let options: String = namespaces
        .iter()
        .map(|ns| {
            let ns = escape(ns);
            format!(r#"<option value="{ns}">{ns}</option>"#)
        })
        .collect();
    let body = format!(
        r#"<h2>Select account</h2>
<p class="hint">You are registered more than once; pick the account to continue with.</p>
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <div class="form-group">
    <label for="namespace">Account</label>
    <select id="namespace" name="namespace">{options}</select>
  </div>
  <button type="submit">Continue</button>
</form>"#,
        action = escape(action),
        csrf = escape(csrf_token),
    );
    page("Select account", &body)
}

/// Registration form for a pool the user is not yet registered in
pub fn register_page(
    action: &str,
    nonce: &str,
    pool_name: &str,
    requires_namespace: bool,
    default_name: &str,
) -> String {
    let namespace_field = if requires_namespace {
        r#"<div class="form-group">
    <label for="namespace">Account name</label>
    <input type="text" id="namespace" name="namespace" required>
  </div>"#
    } else {
        ""
    };
    let body = format!(
        r#"<h2>Complete your registration</h2>
<p class="hint">Registration for {pool} is required before you can continue.</p>
<form method="post" action="{action}">
  <input type="hidden" name="nonce" value="{nonce}">
  <div class="form-group">
    <label for="name">Name</label>
    <input type="text" id="name" name="name" value="{name}" required>
  </div>
  {namespace_field}
  <button type="submit">Register</button>
</form>"#,
        pool = escape(pool_name),
        action = escape(action),
        nonce = escape(nonce),
        name = escape(default_name),
    );
    page("Registration", &body)
}

/// Verification completion page; password reset carries a password field
pub fn verify_page(action: &str, csrf_token: &str, verification_id: &str, is_reset: bool) -> String {
    let (title, hint, extra) = if is_reset {
        (
            "Reset password",
            "Choose a new password for your account.",
            r#"<div class="form-group">
    <label for="password">New password</label>
    <input type="password" id="password" name="password" required>
  </div>"#,
        )
    } else {
        ("Verify email", "Confirm your email address to continue.", "")
    };
    let body = format!(
        r#"<h2>{title}</h2>
<p class="hint">{hint}</p>
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <input type="hidden" name="id" value="{id}">
  {extra}
  <button type="submit">{title}</button>
</form>"#,
        action = escape(action),
        csrf = escape(csrf_token),
        id = escape(verification_id),
    );
    page(title, &body)
}

/// Email entry form shared by /verifyemail and /forgotpassword
pub fn email_form_page(title: &str, hint: &str, action: &str, csrf_token: &str) -> String {
    let body = format!(
        r#"<h2>{title}</h2>
<p class="hint">{hint}</p>
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <div class="form-group">
    <label for="email">Email</label>
    <input type="text" id="email" name="email" required>
  </div>
  <button type="submit">Submit</button>
</form>"#,
        title = escape(title),
        hint = escape(hint),
        action = escape(action),
        csrf = escape(csrf_token),
    );
    page(title, &body)
}

/// Neutral confirmation, deliberately identical whether or not the email
/// exists
pub fn email_sent_page() -> String {
    page(
        "Check your inbox",
        r#"<h2>Check your inbox</h2>
<p class="hint">If the email address is known to us, a message with further
instructions is on its way.</p>"#,
    )
}

pub fn verify_done_page(message: &str) -> String {
    let body = format!(
        r#"<h2>Done</h2>
<p class="hint">{}</p>"#,
        escape(message)
    );
    page("Done", &body)
}

/// Grant manager listing
pub fn grants_page(
    action: &str,
    csrf_token: &str,
    rows: &[(String, String, String, String, String)],
) -> String {
    let table_rows: String = rows
        .iter()
        .map(|(application_id, application, api_id, api, scopes)| {
            format!(
                r#"<tr><td>{app}</td><td>{api}</td><td>{scopes}</td><td>
<form method="post" action="{action}">
  <input type="hidden" name="csrf_token" value="{csrf}">
  <input type="hidden" name="application_id" value="{app_id}">
  <input type="hidden" name="api_id" value="{api_id}">
  <button type="submit" class="secondary">Revoke</button>
</form></td></tr>"#,
                app = escape(application),
                api = escape(api),
                scopes = escape(scopes),
                action = escape(action),
                csrf = escape(csrf_token),
                app_id = escape(application_id),
                api_id = escape(api_id),
            )
        })
        .collect();
    let body = format!(
        r#"<h2>Granted access</h2>
<p class="hint">Applications you have granted access to your data.</p>
<table>
<tr><th>Application</th><th>API</th><th>Scopes</th><th></th></tr>
{table_rows}
</table>"#,
    );
    page("Granted access", &body)
}

pub fn logout_page() -> String {
    page(
        "Signed out",
        r#"<h2>Signed out</h2>
<p class="hint">Your session has ended. You can close this window.</p>"#,
    )
}

/// Error page; links back to the application when a redirect URI is known
pub fn error_page(
    status: StatusCode,
    error: &str,
    description: &str,
    redirect_uri: Option<&str>,
) -> String {
    let back = match redirect_uri {
        Some(uri) => format!(
            r#"<p class="hint"><a href="{}">Return to the application</a></p>"#,
            escape(uri)
        ),
        None => String::new(),
    };
    let body = format!(
        r#"<h2>Something went wrong</h2>
<div class="error">{status} {error}: {description}</div>
{back}"#,
        status = status.as_u16(),
        error = escape(error),
        description = escape(description),
    );
    page("Error", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape(r#"<script>alert("x")</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_login_page_embeds_csrf_and_error() {
        let html = login_page("/auth/local/login", "tok123", Some("Bad credentials"));
        assert!(html.contains(r#"value="tok123""#));
        assert!(html.contains("Bad credentials"));
        assert!(html.contains(r#"action="/auth/local/login""#));
    }

    #[test]
    fn test_consent_page_lists_missing_scopes() {
        let html = consent_page(
            "/auth/local/grant",
            "tok",
            "app1",
            "api1",
            &["write".to_string()],
        );
        assert!(html.contains("<li>write</li>"));
        assert!(html.contains("app1"));
    }

    #[test]
    fn test_error_page_escapes_description() {
        let html = error_page(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "<b>boom</b>",
            None,
        );
        assert!(html.contains("&lt;b&gt;boom&lt;/b&gt;"));
        assert!(!html.contains("<b>boom</b>"));
    }
}
