//! Diagnostic figures (SVG, via `plotters`) and the per-stage HTML report.
//!
//! Each stage collects headings, text, tables and figure files into a
//! [`Report`] and writes `<stage>-report.html` next to the SVGs it links.
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array2;
use plotters::prelude::*;

const PALETTE: [RGBColor; 8] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
];

const SIZE: (u32, u32) = (900, 480);

fn color(i: usize) -> RGBColor {
    PALETTE[i % PALETTE.len()]
}

/// `(min, max)` of `values`, widened when degenerate.
fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo <= f64::EPSILON * lo.abs().max(1.0) {
        let pad = lo.abs().max(1.0) * 0.5;
        return (lo - pad, hi + pad);
    }
    (lo, hi)
}

/// A named polyline.
pub struct Series<'a> {
    pub name: &'a str,
    pub points: Vec<(f64, f64)>,
}

/// Line chart with a legend. Each of `hlines` is drawn as a grey horizontal line.
pub fn line_plot(path: &Path, title: &str, x_desc: &str, y_desc: &str, series: &[Series<'_>], hlines: &[f64]) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let (x0, x1) = bounds(series.iter().flat_map(|s| s.points.iter().map(|p| p.0)));
    let (y0, y1) = bounds(series.iter().flat_map(|s| s.points.iter().map(|p| p.1)).chain(hlines.iter().copied()));
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(title, ("sans-serif", 22))
        .x_label_area_size(35)
        .y_label_area_size(60)
        .build_cartesian_2d(x0..x1, y0..y1)?;
    chart.configure_mesh().x_desc(x_desc).y_desc(y_desc).draw()?;
    for (i, s) in series.iter().enumerate() {
        let c = color(i);
        chart
            .draw_series(LineSeries::new(s.points.iter().copied(), c.stroke_width(2)))?
            .label(s.name)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], c.stroke_width(2)));
    }
    for &h in hlines {
        chart.draw_series(LineSeries::new(vec![(x0, h), (x1, h)], &BLACK.mix(0.5)))?;
    }
    if series.len() > 1 {
        chart.configure_series_labels().background_style(WHITE.mix(0.8)).border_style(BLACK).draw()?;
    }
    root.present().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Vertical bars, one per label.
pub fn bar_plot(path: &Path, title: &str, y_desc: &str, bars: &[(String, f64)]) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let y_max = bars.iter().map(|b| b.1).fold(0.0, f64::max).max(1e-12) * 1.1;
    let formatter = |v: &SegmentValue<usize>| -> String {
        match v {
            SegmentValue::CenterOf(i) => bars.get(*i).map(|b| b.0.clone()).unwrap_or_default(),
            _ => String::new(),
        }
    };
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(title, ("sans-serif", 22))
        .x_label_area_size(60)
        .y_label_area_size(60)
        .build_cartesian_2d((0usize..bars.len().max(1)).into_segmented(), 0.0..y_max)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(bars.len().max(1))
        .x_label_formatter(&formatter)
        .y_desc(y_desc)
        .draw()?;
    chart.draw_series(bars.iter().enumerate().map(|(i, (_, v))| {
        let mut bar =
            Rectangle::new([(SegmentValue::Exact(i), 0.0), (SegmentValue::Exact(i + 1), *v)], color(0).filled());
        bar.set_margin(0, 0, 4, 4);
        bar
    }))?;
    root.present().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Points `(x, y)` coloured by group.
pub fn scatter_plot(path: &Path, title: &str, x_desc: &str, y_desc: &str, groups: &[Series<'_>]) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let (x0, x1) = bounds(groups.iter().flat_map(|s| s.points.iter().map(|p| p.0)));
    let (y0, y1) = bounds(groups.iter().flat_map(|s| s.points.iter().map(|p| p.1)));
    let pad = (y1 - y0) * 0.05;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(title, ("sans-serif", 22))
        .x_label_area_size(35)
        .y_label_area_size(60)
        .build_cartesian_2d(x0..x1, (y0 - pad)..(y1 + pad))?;
    chart.configure_mesh().x_desc(x_desc).y_desc(y_desc).draw()?;
    for (i, g) in groups.iter().enumerate() {
        let c = color(i);
        chart
            .draw_series(g.points.iter().map(|&p| Circle::new(p, 3, c.filled())))?
            .label(g.name)
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, c.filled()));
    }
    if groups.len() > 1 {
        chart.configure_series_labels().background_style(WHITE.mix(0.8)).border_style(BLACK).draw()?;
    }
    root.present().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Diverging blue–white–red colour for `v` in `[vmin, vmax]`.
fn diverging(v: f64, vmin: f64, vmax: f64) -> RGBColor {
    let t = if vmax > vmin { ((v - vmin) / (vmax - vmin)).clamp(0.0, 1.0) } else { 0.5 };
    let lerp = |a: f64, b: f64, u: f64| (a + (b - a) * u).round() as u8;
    if t < 0.5 {
        let u = t / 0.5;
        RGBColor(lerp(59.0, 255.0, u), lerp(76.0, 255.0, u), lerp(192.0, 255.0, u))
    } else {
        let u = (t - 0.5) / 0.5;
        RGBColor(lerp(255.0, 180.0, u), lerp(255.0, 4.0, u), lerp(255.0, 38.0, u))
    }
}

/// Image of `z[y, x]` on the `x` / `y` grid.
pub fn heatmap(
    path: &Path,
    title: &str,
    (x_desc, y_desc): (&str, &str),
    x: &[f64],
    y: &[f64],
    z: &Array2<f64>,
    (vmin, vmax): (f64, f64),
) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let step = |v: &[f64], i: usize| -> f64 {
        if v.len() > 1 { v[(i + 1).min(v.len() - 1)] - v[i.min(v.len() - 2)] } else { 1.0 }
    };
    let (x0, x1) = (x.first().copied().unwrap_or(0.0), x.last().copied().unwrap_or(1.0) + step(x, x.len().saturating_sub(1)));
    let (y0, y1) = (y.first().copied().unwrap_or(0.0), y.last().copied().unwrap_or(1.0) + step(y, y.len().saturating_sub(1)));
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(title, ("sans-serif", 22))
        .x_label_area_size(35)
        .y_label_area_size(50)
        .build_cartesian_2d(x0..x1, y0..y1)?;
    chart.configure_mesh().disable_mesh().x_desc(x_desc).y_desc(y_desc).draw()?;
    chart.draw_series(z.indexed_iter().filter(|((r, c), _)| *r < y.len() && *c < x.len()).map(|((r, c), &v)| {
        Rectangle::new([(x[c], y[r]), (x[c] + step(x, c), y[r] + step(y, r))], diverging(v, vmin, vmax).filled())
    }))?;
    root.present().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ── HTML report ───────────────────────────────────────────────────────────

enum Item {
    Heading(String),
    Text(String),
    Figure { file: String, caption: String },
    Table { header: Vec<String>, rows: Vec<Vec<String>> },
}

/// HTML report of one stage.
pub struct Report {
    title: String,
    items: Vec<Item>,
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

impl Report {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), items: Vec::new() }
    }

    pub fn heading(&mut self, text: impl Into<String>) -> &mut Self {
        self.items.push(Item::Heading(text.into()));
        self
    }

    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        self.items.push(Item::Text(text.into()));
        self
    }

    /// Link a figure; `path` is stored relative to the report directory.
    pub fn figure(&mut self, path: &Path, caption: impl Into<String>) -> &mut Self {
        let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
        self.items.push(Item::Figure { file, caption: caption.into() });
        self
    }

    pub fn table(&mut self, header: Vec<String>, rows: Vec<Vec<String>>) -> &mut Self {
        self.items.push(Item::Table { header, rows });
        self
    }

    pub fn to_html(&self) -> String {
        let mut html = String::new();
        let _ = write!(
            html,
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{t}</title>\
             <style>body{{font-family:sans-serif;max-width:960px;margin:auto}}\
             table{{border-collapse:collapse}}td,th{{border:1px solid #999;padding:2px 6px}}\
             figure{{margin:1em 0}}</style></head><body>\n<h1>{t}</h1>\n",
            t = escape(&self.title)
        );
        for item in &self.items {
            match item {
                Item::Heading(h) => {
                    let _ = writeln!(html, "<h2>{}</h2>", escape(h));
                }
                Item::Text(p) => {
                    let _ = writeln!(html, "<p>{}</p>", escape(p));
                }
                Item::Figure { file, caption } => {
                    let _ = writeln!(
                        html,
                        "<figure><img src=\"{}\" width=\"900\"><figcaption>{}</figcaption></figure>",
                        escape(file),
                        escape(caption)
                    );
                }
                Item::Table { header, rows } => {
                    html.push_str("<table>\n<tr>");
                    for h in header {
                        let _ = write!(html, "<th>{}</th>", escape(h));
                    }
                    html.push_str("</tr>\n");
                    for row in rows {
                        html.push_str("<tr>");
                        for cell in row {
                            let _ = write!(html, "<td>{}</td>", escape(cell));
                        }
                        html.push_str("</tr>\n");
                    }
                    html.push_str("</table>\n");
                }
            }
        }
        html.push_str("</body></html>\n");
        html
    }

    /// Write `<dir>/<stage>-report.html`; returns its path.
    pub fn write(&self, dir: &Path, stage: &str) -> Result<PathBuf> {
        let path = dir.join(format!("{stage}-report.html"));
        std::fs::write(&path, self.to_html()).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escapes_and_links_figures() {
        let mut r = Report::new("01 <maxwell>");
        r.heading("Run 1").text("a & b").figure(Path::new("/tmp/out/01_r1.svg"), "scores");
        r.table(vec!["run".into(), "bads".into()], vec![vec!["1".into(), "['MEG0111']".into()]]);
        let html = r.to_html();
        assert!(html.contains("<h1>01 &lt;maxwell&gt;</h1>"));
        assert!(html.contains("a &amp; b"));
        assert!(html.contains("src=\"01_r1.svg\""));
        assert!(html.contains("<td>[&#x27;MEG0111&#x27;]</td>") || html.contains("<td>['MEG0111']</td>"));
    }

    #[test]
    fn figures_are_written_as_svg() {
        let dir = tempfile::tempdir().unwrap();
        let line = dir.path().join("line.svg");
        let series = [Series { name: "gfp", points: (0..50).map(|i| (i as f64 * 0.01, (i as f64).sin())).collect() }];
        line_plot(&line, "GFP", "Time (s)", "fT", &series, &[0.5]).unwrap();
        let bars = dir.path().join("bars.svg");
        bar_plot(&bars, "drops", "%", &[("MEG0111".into(), 3.0), ("EEG001".into(), 1.0)]).unwrap();
        let heat = dir.path().join("heat.svg");
        let z = Array2::from_shape_fn((3, 4), |(r, c)| (r + c) as f64);
        heatmap(&heat, "TFR", ("Time (s)", "Frequency (Hz)"), &[0.0, 0.1, 0.2, 0.3], &[2.0, 3.0, 4.0], &z, (0.0, 5.0)).unwrap();
        for p in [line, bars, heat] {
            let svg = std::fs::read_to_string(&p).unwrap();
            assert!(svg.starts_with("<svg"), "{} is not an SVG", p.display());
        }
    }

    #[test]
    fn diverging_endpoints() {
        assert_eq!(diverging(-1.0, -1.0, 1.0), RGBColor(59, 76, 192));
        assert_eq!(diverging(0.0, -1.0, 1.0), RGBColor(255, 255, 255));
        assert_eq!(diverging(5.0, -1.0, 1.0), RGBColor(180, 4, 38));
    }
}
