//! Proxy configuration rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Active ports per room, ordered for deterministic output.
pub type RouteTable = BTreeMap<String, BTreeSet<u16>>;

/// Upstream block name for a room port. Room ids are already restricted to
/// `[A-Za-z0-9_-]`, so the id is used as is and distinct rooms never share a name.
pub fn upstream_name(room_id: &str, port: u16) -> String {
    format!("room_{}_port_{}", room_id, port)
}

fn write_location(out: &mut String, prefix: &str, upstream: &str) {
    let _ = writeln!(out, "        location {} {{", prefix);
    let _ = writeln!(out, "            proxy_pass http://{};", upstream);
    out.push_str("            proxy_http_version 1.1;\n");
    out.push_str("            proxy_set_header Upgrade $http_upgrade;\n");
    out.push_str("            proxy_set_header Connection \"upgrade\";\n");
    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        }\n");
}

/// Render the complete nginx configuration for `routes`.
///
/// Every room port gets `/<room>/<port>/`; a room with at least one port also gets
/// `/<room>/`, routed to its lowest port. Upstreams address room containers by name
/// (`<container_prefix><room>`) on the shared network. The same table always renders to
/// the same bytes.
pub fn render_config(routes: &RouteTable, container_prefix: &str) -> String {
    let mut out = String::new();
    out.push_str("# Generated by cloudroom. Rewritten on every port change.\n");
    out.push_str("worker_processes 1;\n");
    out.push_str("events { worker_connections 1024; }\n\n");
    out.push_str("http {\n");

    for (room_id, ports) in routes {
        for port in ports {
            let _ = writeln!(out, "\n    upstream {} {{", upstream_name(room_id, *port));
            let _ = writeln!(
                out,
                "        server {}{}:{};",
                container_prefix, room_id, port
            );
            out.push_str("    }\n");
        }
    }

    out.push_str("\n    server {\n");
    out.push_str("        listen 80;\n\n");
    for (room_id, ports) in routes {
        let Some(first) = ports.first() else {
            continue;
        };
        write_location(
            &mut out,
            &format!("/{}/", room_id),
            &upstream_name(room_id, *first),
        );
        for port in ports {
            write_location(
                &mut out,
                &format!("/{}/{}/", room_id, port),
                &upstream_name(room_id, *port),
            );
        }
    }
    out.push_str("        location / { return 404 \"No room or port specified\\n\"; }\n");
    out.push_str("    }\n");
    out.push_str("}\n");
    out
}
