//! Virtual host templates.
//!
//! Plain placeholder substitution: `@DOMAIN@`, `@ROOT@`, `@PHP@`,
//! `@FULLCHAIN@`, `@KEY@`, `@SOCKET@`.

use sitekeeper_common::Backend;
use std::path::{Path, PathBuf};

pub const MANAGED_MARKER: &str = "# Managed by sitekeeper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub fullchain: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SiteTemplate<'a> {
    pub domain: &'a str,
    pub document_root: &'a Path,
    pub php_socket: Option<&'a str>,
    pub tls: Option<&'a TlsPaths>,
}

const NGINX_HTTP: &str = r#"@MARKER@: @DOMAIN@
server {
    listen 80;
    listen [::]:80;
    server_name @DOMAIN@;

    root @ROOT@;
    index index.php index.html index.htm;

    access_log /var/log/nginx/@DOMAIN@.access.log;
    error_log /var/log/nginx/@DOMAIN@.error.log;

    location /.well-known/acme-challenge/ {
        try_files $uri =404;
    }

    location / {
        try_files $uri $uri/ =404;
    }
@PHP@
    location ~ /\.(?!well-known) {
        deny all;
    }
}
"#;

const NGINX_TLS: &str = r#"@MARKER@: @DOMAIN@
server {
    listen 80;
    listen [::]:80;
    server_name @DOMAIN@;

    root @ROOT@;

    location /.well-known/acme-challenge/ {
        try_files $uri =404;
    }

    location / {
        return 301 https://$host$request_uri;
    }
}

server {
    listen 443 ssl;
    listen [::]:443 ssl;
    http2 on;
    server_name @DOMAIN@;

    ssl_certificate @FULLCHAIN@;
    ssl_certificate_key @KEY@;
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers off;
    ssl_session_cache shared:SSL:10m;
    add_header Strict-Transport-Security "max-age=31536000" always;

    root @ROOT@;
    index index.php index.html index.htm;

    access_log /var/log/nginx/@DOMAIN@.access.log;
    error_log /var/log/nginx/@DOMAIN@.error.log;

    location / {
        try_files $uri $uri/ =404;
    }
@PHP@
    location ~ /\.(?!well-known) {
        deny all;
    }
}
"#;

const NGINX_PHP: &str = r#"
    location ~ \.php$ {
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:@SOCKET@;
    }
"#;

const APACHE_HTTP: &str = r#"@MARKER@: @DOMAIN@
<VirtualHost *:80>
    ServerName @DOMAIN@
    DocumentRoot @ROOT@

    <Directory @ROOT@>
        Options -Indexes +FollowSymLinks
        AllowOverride All
        Require all granted
    </Directory>
@PHP@
    ErrorLog ${APACHE_LOG_DIR}/@DOMAIN@-error.log
    CustomLog ${APACHE_LOG_DIR}/@DOMAIN@-access.log combined
</VirtualHost>
"#;

const APACHE_TLS: &str = r#"@MARKER@: @DOMAIN@
<VirtualHost *:80>
    ServerName @DOMAIN@
    DocumentRoot @ROOT@

    RewriteEngine On
    RewriteCond %{REQUEST_URI} !^/\.well-known/acme-challenge/
    RewriteRule ^ https://%{SERVER_NAME}%{REQUEST_URI} [END,NE,R=permanent]
</VirtualHost>

<VirtualHost *:443>
    ServerName @DOMAIN@
    DocumentRoot @ROOT@

    SSLEngine on
    SSLCertificateFile @FULLCHAIN@
    SSLCertificateKeyFile @KEY@

    <Directory @ROOT@>
        Options -Indexes +FollowSymLinks
        AllowOverride All
        Require all granted
    </Directory>
@PHP@
    ErrorLog ${APACHE_LOG_DIR}/@DOMAIN@-error.log
    CustomLog ${APACHE_LOG_DIR}/@DOMAIN@-access.log combined
</VirtualHost>
"#;

const APACHE_PHP: &str = r#"
    <FilesMatch \.php$>
        SetHandler "proxy:unix:@SOCKET@|fcgi://localhost"
    </FilesMatch>
"#;

pub fn render(backend: Backend, site: &SiteTemplate<'_>) -> String {
    let (base, php) = match (backend, site.tls.is_some()) {
        (Backend::Nginx, false) => (NGINX_HTTP, NGINX_PHP),
        (Backend::Nginx, true) => (NGINX_TLS, NGINX_PHP),
        (Backend::Apache, false) => (APACHE_HTTP, APACHE_PHP),
        (Backend::Apache, true) => (APACHE_TLS, APACHE_PHP),
    };
    let php_block = match site.php_socket {
        Some(socket) => php.replace("@SOCKET@", socket),
        None => String::new(),
    };

    let mut out = base
        .replace("@MARKER@", MANAGED_MARKER)
        .replace("@PHP@", php_block.trim_end_matches('\n'))
        .replace("@DOMAIN@", site.domain)
        .replace("@ROOT@", &site.document_root.display().to_string());
    if let Some(tls) = site.tls {
        out = out
            .replace("@FULLCHAIN@", &tls.fullchain.display().to_string())
            .replace("@KEY@", &tls.key.display().to_string());
    }
    out
}

/// Apache modules a rendered site depends on.
pub fn apache_modules(site: &SiteTemplate<'_>) -> Vec<&'static str> {
    let mut modules = Vec::new();
    if site.tls.is_some() {
        modules.extend(["ssl", "rewrite"]);
    }
    if site.php_socket.is_some() {
        modules.extend(["proxy", "proxy_fcgi"]);
    }
    modules
}

pub fn placeholder_page(domain: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{domain}</title>\n</head>\n\
         <body>\n<h1>{domain}</h1>\n<p>This site is ready for content.</p>\n</body>\n</html>\n"
    )
}
