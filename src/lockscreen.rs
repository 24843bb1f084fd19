//! Lock screen page
//!
//! Shown to visitors without a valid auth cookie. The form posts to the
//! login path with the password and the page they originally asked for.

use crate::gate::LOGIN_PATH;

/// Render the lock screen, optionally with an error message
pub fn render(error: Option<&str>, redirect: &str) -> String {
    let error_block = match error {
        Some(msg) => format!(r#"<div class="error">{}</div>"#, escape_html(msg)),
        None => String::new(),
    };

    LOCK_SCREEN_TEMPLATE
        .replace("{{LOGIN_PATH}}", LOGIN_PATH)
        .replace("{{ERROR}}", &error_block)
        .replace("{{REDIRECT}}", &escape_html(redirect))
}

/// Escape text for use in HTML content and quoted attributes
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const LOCK_SCREEN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>LocalRun Protected Tunnel</title>
    <style>
        * { box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #0f172a;
            color: #e2e8f0;
            min-height: 100vh;
            margin: 0;
            display: flex;
            align-items: center;
            justify-content: center;
        }
        .container {
            background: #1e293b;
            border: 1px solid #334155;
            border-radius: 1rem;
            padding: 2rem;
            width: 100%;
            max-width: 400px;
            text-align: center;
        }
        .logo { font-size: 2rem; margin-bottom: 1rem; }
        h1 { font-size: 1.5rem; font-weight: 600; margin-bottom: 1.5rem; }
        .error { color: #ef4444; font-size: 0.875rem; margin-bottom: 1rem; }
        input[type="password"] {
            width: 100%;
            padding: 0.75rem;
            margin-bottom: 1rem;
            border: 1px solid #475569;
            border-radius: 0.5rem;
            background: #0f172a;
            color: #fff;
            font-size: 1rem;
        }
        input[type="password"]:focus { outline: none; border-color: #3b82f6; }
        button {
            width: 100%;
            padding: 0.75rem;
            border: none;
            border-radius: 0.5rem;
            background: #3b82f6;
            color: #fff;
            font-size: 1rem;
            font-weight: 500;
            cursor: pointer;
        }
        button:hover { background: #2563eb; }
    </style>
</head>
<body>
    <div class="container">
        <div class="logo">&#128274;</div>
        <h1>Protected Tunnel</h1>
        {{ERROR}}
        <form action="{{LOGIN_PATH}}" method="POST">
            <input type="hidden" name="redirect" value="{{REDIRECT}}">
            <input type="password" name="password" placeholder="Enter password" required autofocus>
            <button type="submit">Access Tunnel</button>
        </form>
    </div>
</body>
</html>"#;
