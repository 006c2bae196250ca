//! HTML page builders shaped like the real source pages.

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A page with one table. Cells are raw HTML; rows may have any length,
/// which lets tests build malformed rows.
pub fn table_page(class: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut html = String::from("<!DOCTYPE html><html><head><title>fixture</title></head><body>\n");
    html.push_str(&format!("<table class=\"{}\">\n<thead><tr>", class));
    for header in headers {
        html.push_str(&format!("<th>{}</th>", escape(header)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", cell));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n</body></html>\n");
    html
}

fn text_cells(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| escape(c)).collect()
}

/// formula1.com driver standings: (pos, driver, nationality, car, pts).
pub fn f1_driver_standings(rows: &[(&str, &str, &str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(pos, driver, nat, car, pts)| text_cells(&[pos, driver, nat, car, pts]))
        .collect();
    table_page(
        "f1-table f1-table-with-data",
        &["Pos", "Driver", "Nationality", "Car", "Pts"],
        &rows,
    )
}

/// formula1.com team standings: (pos, team, pts).
pub fn f1_team_standings(rows: &[(&str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(pos, team, pts)| text_cells(&[pos, team, pts]))
        .collect();
    table_page("f1-table f1-table-with-data", &["Pos", "Team", "Pts"], &rows)
}

/// formula1.com season races index: (grand prix, result link, date).
pub fn f1_races_index(rows: &[(&str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(name, href, date)| {
            vec![
                format!("<a href=\"{}\">{}</a>", href, escape(name)),
                escape(date),
                "Max Verstappen VER".to_string(),
                "Red Bull Racing Honda RBPT".to_string(),
                "57".to_string(),
                "1:31:44.742".to_string(),
            ]
        })
        .collect();
    table_page(
        "f1-table f1-table-with-data",
        &["Grand Prix", "Date", "Winner", "Car", "Laps", "Time"],
        &rows,
    )
}

/// formula1.com race classification:
/// (pos, no, driver, car, laps, time/retired, pts).
pub fn f1_race_result(rows: &[(&str, &str, &str, &str, &str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(pos, no, driver, car, laps, time, pts)| {
            text_cells(&[pos, no, driver, car, laps, time, pts])
        })
        .collect();
    table_page(
        "f1-table f1-table-with-data",
        &["Pos", "No", "Driver", "Car", "Laps", "Time / Retired", "Pts"],
        &rows,
    )
}

/// Wikipedia drivers list: (name, nationality, championships, wins, podiums).
pub fn wikipedia_drivers(rows: &[(&str, &str, &str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(name, nat, titles, wins, podiums)| {
            text_cells(&[name, nat, "2015–2024", titles, wins, podiums])
        })
        .collect();
    table_page(
        "wikitable sortable",
        &[
            "Driver name",
            "Nationality",
            "Seasons competed",
            "Drivers' Championships",
            "Race wins",
            "Podiums",
        ],
        &rows,
    )
}

/// Wikipedia constructors list: (constructor, engine, licensed in, based in, WCC).
pub fn wikipedia_constructors(rows: &[(&str, &str, &str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(name, engine, licensed, based, titles)| {
            text_cells(&[name, engine, licensed, based, "—", titles])
        })
        .collect();
    table_page(
        "wikitable sortable",
        &["Constructor", "Engine", "Licensed in", "Based in", "Wins", "WCC"],
        &rows,
    )
}

/// Wikipedia season calendar: (round, grand prix, circuit, race date).
pub fn wikipedia_calendar(rows: &[(&str, &str, &str, &str)]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|&(round, gp, circuit, date)| text_cells(&[round, gp, circuit, date]))
        .collect();
    table_page(
        "wikitable",
        &["Round", "Grand Prix", "Circuit", "Race date"],
        &rows,
    )
}
