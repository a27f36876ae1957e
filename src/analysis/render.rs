//! Self-contained interactive HTML artifact.

use serde::Serialize;

use super::{AnalysisReport, ClusterLabel};
use crate::models::Metadata;
use crate::utils::preview;

const PREVIEW_CHARS: usize = 200;

const PALETTE: [&str; 15] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f",
    "#bcbd22", "#17becf", "#aec7e8", "#ffbb78", "#98df8a", "#ff9896", "#c5b0d5",
];

#[derive(Serialize)]
struct Payload<'a> {
    title: &'a str,
    palette: &'a [&'a str],
    clusters: usize,
    points: Vec<PlotPoint<'a>>,
}

#[derive(Serialize)]
struct PlotPoint<'a> {
    id: &'a str,
    source: &'a str,
    preview: String,
    metadata: &'a Metadata,
    /// `null` for outliers.
    cluster: Option<u32>,
    p2: [f64; 2],
    p3: [f64; 3],
}

/// Render `report` as one HTML document with no external resources.
pub fn render_html(report: &AnalysisReport) -> Result<String, serde_json::Error> {
    let title = format!(
        "{} ({} of {} points, {} clusters)",
        report.collection,
        report.assignments.len(),
        report.total_points,
        report.clusters
    );

    let points = report
        .assignments
        .iter()
        .zip(&report.points)
        .map(|(a, p)| PlotPoint {
            id: &a.id,
            source: &p.source,
            preview: preview(&p.text, PREVIEW_CHARS),
            metadata: &p.metadata,
            cluster: match a.label {
                ClusterLabel::Cluster(c) => Some(c),
                ClusterLabel::Outlier => None,
            },
            p2: a.coords_2d,
            p3: a.coords_3d,
        })
        .collect();

    let payload = Payload {
        title: &title,
        palette: &PALETTE,
        clusters: report.clusters,
        points,
    };
    let data = script_safe_json(&serde_json::to_string(&payload)?);

    Ok(TEMPLATE
        .replace("__TITLE__", &escape_html(&title))
        .replace("__DATA__", &data))
}

/// JSON that cannot terminate the surrounding `<script>` element.
fn script_safe_json(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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

const TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>__TITLE__</title>
<style>
  body { margin: 0; font-family: system-ui, sans-serif; background: #fafafa; color: #222; }
  header { padding: 10px 16px; display: flex; gap: 12px; align-items: center; border-bottom: 1px solid #ddd; }
  header h1 { font-size: 16px; margin: 0; flex: 1; }
  button { padding: 4px 12px; border: 1px solid #888; background: #fff; cursor: pointer; }
  button.active { background: #333; color: #fff; }
  #wrap { display: flex; }
  canvas { flex: 1; cursor: crosshair; }
  #legend { width: 180px; padding: 8px; font-size: 12px; overflow-y: auto; }
  #legend div { display: flex; align-items: center; gap: 6px; margin: 2px 0; }
  #legend span.swatch { width: 10px; height: 10px; display: inline-block; border-radius: 50%; }
  #tip { position: fixed; pointer-events: none; max-width: 360px; background: #fff; border: 1px solid #999;
         padding: 6px 8px; font-size: 12px; white-space: pre-wrap; display: none; box-shadow: 0 2px 6px rgba(0,0,0,.2); }
</style>
</head>
<body>
<header>
  <h1>__TITLE__</h1>
  <button id="b3">3D view</button>
  <button id="b2">2D view</button>
</header>
<div id="wrap">
  <canvas id="plot"></canvas>
  <div id="legend"></div>
</div>
<div id="tip"></div>
<script id="data" type="application/json">__DATA__</script>
<script>
(function () {
  var data = JSON.parse(document.getElementById("data").textContent);
  var canvas = document.getElementById("plot");
  var ctx = canvas.getContext("2d");
  var tip = document.getElementById("tip");
  var mode = 3, yaw = 0.6, pitch = 0.4, drag = null, screen = [];

  function color(p) {
    return p.cluster === null ? "#000" : data.palette[p.cluster % data.palette.length];
  }

  function bounds(key, dims) {
    var lo = [], hi = [];
    for (var d = 0; d < dims; d++) { lo.push(Infinity); hi.push(-Infinity); }
    data.points.forEach(function (p) {
      for (var d = 0; d < dims; d++) {
        lo[d] = Math.min(lo[d], p[key][d]);
        hi[d] = Math.max(hi[d], p[key][d]);
      }
    });
    return { lo: lo, hi: hi };
  }
  var b2 = bounds("p2", 2), b3 = bounds("p3", 3);

  function norm(v, b, d) {
    var span = b.hi[d] - b.lo[d];
    return span > 0 ? (v - b.lo[d]) / span * 2 - 1 : 0;
  }

  function project(p) {
    if (mode === 2) return [norm(p.p2[0], b2, 0), norm(p.p2[1], b2, 1), 0];
    var x = norm(p.p3[0], b3, 0), y = norm(p.p3[1], b3, 1), z = norm(p.p3[2], b3, 2);
    var cx = Math.cos(yaw) * x - Math.sin(yaw) * z;
    var cz = Math.sin(yaw) * x + Math.cos(yaw) * z;
    var cy = Math.cos(pitch) * y - Math.sin(pitch) * cz;
    var depth = Math.sin(pitch) * y + Math.cos(pitch) * cz;
    return [cx, cy, depth];
  }

  function draw() {
    canvas.width = canvas.clientWidth;
    canvas.height = window.innerHeight - 60;
    var w = canvas.width, h = canvas.height, s = Math.min(w, h) * 0.42;
    ctx.clearRect(0, 0, w, h);
    screen = data.points.map(function (p, i) {
      var c = project(p);
      return { i: i, x: w / 2 + c[0] * s, y: h / 2 - c[1] * s, depth: c[2] };
    });
    var order = screen.slice().sort(function (a, b) { return a.depth - b.depth; });
    order.forEach(function (q) {
      var p = data.points[q.i];
      ctx.globalAlpha = 0.75;
      if (p.cluster === null) {
        ctx.strokeStyle = "#000";
        ctx.lineWidth = 1.5;
        ctx.beginPath();
        ctx.moveTo(q.x - 4, q.y - 4); ctx.lineTo(q.x + 4, q.y + 4);
        ctx.moveTo(q.x + 4, q.y - 4); ctx.lineTo(q.x - 4, q.y + 4);
        ctx.stroke();
      } else {
        ctx.fillStyle = color(p);
        ctx.beginPath();
        ctx.arc(q.x, q.y, mode === 2 ? 4 : 3, 0, Math.PI * 2);
        ctx.fill();
      }
    });
    ctx.globalAlpha = 1;
  }

  function legend() {
    var el = document.getElementById("legend");
    var counts = {}, outliers = 0;
    data.points.forEach(function (p) {
      if (p.cluster === null) outliers++; else counts[p.cluster] = (counts[p.cluster] || 0) + 1;
    });
    for (var c = 0; c < data.clusters; c++) {
      var row = document.createElement("div");
      var sw = document.createElement("span");
      sw.className = "swatch";
      sw.style.background = data.palette[c % data.palette.length];
      row.appendChild(sw);
      row.appendChild(document.createTextNode("Cluster " + c + " (" + (counts[c] || 0) + ")"));
      el.appendChild(row);
    }
    var out = document.createElement("div");
    out.textContent = "× Outliers (" + outliers + ")";
    el.appendChild(out);
  }

  function setMode(m) {
    mode = m;
    document.getElementById("b2").className = m === 2 ? "active" : "";
    document.getElementById("b3").className = m === 3 ? "active" : "";
    draw();
  }

  canvas.addEventListener("mousedown", function (e) { drag = [e.clientX, e.clientY]; });
  window.addEventListener("mouseup", function () { drag = null; });
  canvas.addEventListener("mousemove", function (e) {
    if (drag && mode === 3) {
      yaw += (e.clientX - drag[0]) * 0.01;
      pitch += (e.clientY - drag[1]) * 0.01;
      drag = [e.clientX, e.clientY];
      draw();
      return;
    }
    var r = canvas.getBoundingClientRect(), mx = e.clientX - r.left, my = e.clientY - r.top;
    var best = null, bestD = 64;
    screen.forEach(function (q) {
      var d = (q.x - mx) * (q.x - mx) + (q.y - my) * (q.y - my);
      if (d < bestD) { bestD = d; best = q; }
    });
    if (!best) { tip.style.display = "none"; return; }
    var p = data.points[best.i];
    var lines = [
      "ID: " + p.id,
      "Source: " + p.source,
      p.cluster === null ? "Outlier" : "Cluster " + p.cluster
    ];
    Object.keys(p.metadata).forEach(function (k) { lines.push(k + ": " + p.metadata[k]); });
    lines.push("", p.preview);
    tip.textContent = lines.join("\n");
    tip.style.left = (e.clientX + 14) + "px";
    tip.style.top = (e.clientY + 14) + "px";
    tip.style.display = "block";
  });
  canvas.addEventListener("mouseleave", function () { tip.style.display = "none"; });
  document.getElementById("b2").addEventListener("click", function () { setMode(2); });
  document.getElementById("b3").addEventListener("click", function () { setMode(3); });
  window.addEventListener("resize", draw);

  legend();
  setMode(3);
})();
</script>
</body>
</html>
"##;
