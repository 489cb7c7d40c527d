use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, Padding, Paragraph, Row, Table, TableState, Wrap,
};
use ratatui::Frame;
use textwrap::wrap;
use unicode_width::UnicodeWidthStr;

use crate::catalog::Post;
use crate::preview::{Placement, PreviewContent};
use crate::query::{self, FilterToken, LineEditor, Shortcut};
use crate::session::{MenuFocus, Mode, SessionState, TableLayout};

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_WARNING: Color = Color::Rgb(249, 226, 175);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const QUIT_PROMPT: &str = "Are you sure you want to quit? (y/n)";
const SEARCH_BOX_WIDTH: u16 = 60;
const BANNER: &str = r"       __  _         _
  ___ / /_| |_ _   _(_)
 / _ \ '_ \ __| | | | |
|  __/ (_) | |_| |_| | |
 \___|\___/ \__|\__,_|_|";

pub fn spinner_frame(index: usize) -> &'static str {
    SPINNER_FRAMES[index % SPINNER_FRAMES.len()]
}

/// Regions of the browsing screen. The state machine derives preview
/// placement and paging distance from the same geometry the renderer draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenLayout {
    pub top: Rect,
    pub preview: Rect,
    pub side: Rect,
    pub status: Rect,
}

impl ScreenLayout {
    pub fn preview_placement(&self) -> Placement {
        Placement::inside_pane(
            self.preview.x,
            self.preview.y,
            self.preview.width,
            self.preview.height,
        )
    }

    /// Rows of posts visible in the results table.
    pub fn table_rows(&self) -> usize {
        // borders, header and header margin
        usize::from(self.side.height.saturating_sub(4))
    }
}

pub fn screen_layout(width: u16, height: u16) -> ScreenLayout {
    let body_height = height.saturating_sub(2);
    let preview_width = (u32::from(width) * 3 / 4) as u16;
    let body_y = height.min(1);
    ScreenLayout {
        top: Rect::new(0, 0, width, height.min(1)),
        preview: Rect::new(0, body_y, preview_width, body_height),
        side: Rect::new(
            preview_width,
            body_y,
            width.saturating_sub(preview_width),
            body_height,
        ),
        status: Rect::new(0, height.saturating_sub(1), width, height.min(1)),
    }
}

pub fn render(frame: &mut Frame<'_>, state: &SessionState) {
    let area = frame.size();
    frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), area);

    match state.mode {
        Mode::QuitConfirm => draw_quit_prompt(frame, area),
        Mode::FatalError => draw_error(frame, area, state),
        Mode::EntranceMenu => draw_menu(frame, area, state),
        Mode::Browsing | Mode::TagPopup if state.loading => draw_loading(frame, area, state),
        Mode::Browsing | Mode::TagPopup => draw_browser(frame, state),
    }
}

fn centered(width: u16, height: u16, area: Rect) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}

fn draw_quit_prompt(frame: &mut Frame<'_>, area: Rect) {
    let width = UnicodeWidthStr::width(QUIT_PROMPT) as u16 + 6;
    let popup = centered(width, 3, area);
    frame.render_widget(Clear, popup);
    let prompt = Paragraph::new(QUIT_PROMPT)
        .alignment(Alignment::Center)
        .style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .add_modifier(Modifier::BOLD),
        )
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(Style::default().fg(COLOR_ACCENT))
                .style(Style::default().bg(COLOR_PANEL_BG)),
        );
    frame.render_widget(prompt, popup);
}

fn draw_error(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let message = state
        .last_error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown error".to_string());
    let box_width = area.width.saturating_sub(4).min(72);
    let inner_width = usize::from(box_width.saturating_sub(4)).max(1);

    let mut lines = vec![Line::from("An error occurred:"), Line::default()];
    lines.extend(
        wrap(&message, inner_width)
            .into_iter()
            .map(|line| Line::from(line.into_owned())),
    );
    lines.push(Line::default());
    lines.push(Line::from(Span::styled(
        "Press Esc to quit.",
        Style::default()
            .fg(COLOR_TEXT_SECONDARY)
            .add_modifier(Modifier::ITALIC),
    )));

    let popup = centered(box_width, lines.len() as u16 + 2, area);
    frame.render_widget(Clear, popup);
    let body = Paragraph::new(lines)
        .style(Style::default().fg(COLOR_TEXT_PRIMARY))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(Style::default().fg(COLOR_ERROR))
                .padding(Padding::horizontal(1))
                .style(Style::default().bg(COLOR_PANEL_BG)),
        );
    frame.render_widget(body, popup);
}

fn draw_loading(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let text = format!(
        "{} Fetching data for '{}'...",
        spinner_frame(state.spinner),
        state.active_query
    );
    let width = UnicodeWidthStr::width(text.as_str()) as u16;
    let line = centered(width, 1, area);
    frame.render_widget(
        Paragraph::new(text).style(Style::default().fg(COLOR_TEXT_PRIMARY)),
        line,
    );
}

fn draw_menu(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let banner_lines: Vec<&str> = BANNER.lines().collect();
    let banner_width = banner_lines
        .iter()
        .map(|line| UnicodeWidthStr::width(*line))
        .max()
        .unwrap_or_default() as u16;
    let block_height = banner_lines.len() as u16 + 1 + 3 + 1 + 1 + 1 + 1;
    let block = centered(SEARCH_BOX_WIDTH.max(banner_width), block_height, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(banner_lines.len() as u16),
            Constraint::Length(1),
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(block);

    let banner = Paragraph::new(Text::from(
        banner_lines
            .iter()
            .map(|line| Line::from(*line))
            .collect::<Vec<_>>(),
    ))
    .alignment(Alignment::Center)
    .style(
        Style::default()
            .fg(COLOR_ACCENT)
            .add_modifier(Modifier::BOLD),
    );
    frame.render_widget(banner, rows[0]);

    let editing = state.menu_focus == MenuFocus::Editing;
    let border = if editing {
        COLOR_BORDER_FOCUSED
    } else {
        COLOR_BORDER_IDLE
    };
    let search = Paragraph::new(search_line(&state.editor, editing)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(border))
            .padding(Padding::horizontal(1))
            .style(Style::default().bg(COLOR_PANEL_BG)),
    );
    frame.render_widget(search, rows[2]);

    let button = |shortcut: Shortcut| {
        let label = format!(" {} ", shortcut.label());
        if !editing && state.shortcut == shortcut {
            Span::styled(
                label,
                Style::default()
                    .fg(COLOR_BG)
                    .bg(COLOR_ACCENT)
                    .add_modifier(Modifier::BOLD),
            )
        } else {
            Span::styled(
                label,
                Style::default()
                    .fg(COLOR_TEXT_PRIMARY)
                    .bg(COLOR_PANEL_SELECTED_BG),
            )
        }
    };
    let buttons = Paragraph::new(Line::from(vec![
        button(Shortcut::Latest),
        Span::raw("  "),
        button(Shortcut::Popular),
    ]))
    .alignment(Alignment::Center);
    frame.render_widget(buttons, rows[4]);

    let help = if editing {
        "enter: search | tab: select buttons | esc: quit"
    } else {
        "←/→: nav | enter: select | tab: edit search | esc: quit"
    };
    frame.render_widget(
        Paragraph::new(help)
            .alignment(Alignment::Center)
            .style(
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .add_modifier(Modifier::ITALIC),
            ),
        rows[6],
    );
}

/// Renders editor text with `key:value` filters highlighted and, when
/// `show_cursor` is set, a reversed cursor cell.
pub fn search_line(editor: &LineEditor, show_cursor: bool) -> Line<'static> {
    let text = editor.text();
    let base = Style::default().fg(COLOR_TEXT_PRIMARY);
    let mut styles = vec![base; text.len()];
    for token in query::parse_filters(text) {
        if let FilterToken::KeyValue { key, value } = token {
            styles[key].fill(base.fg(COLOR_SUCCESS));
            styles[value].fill(base.fg(COLOR_WARNING));
        }
    }

    let cursor = show_cursor.then(|| editor.cursor_byte());
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut run = String::new();
    let mut run_style = base;
    for (idx, ch) in text.char_indices() {
        let mut style = styles[idx];
        if cursor == Some(idx) {
            style = style.add_modifier(Modifier::REVERSED);
        }
        if style != run_style && !run.is_empty() {
            spans.push(Span::styled(std::mem::take(&mut run), run_style));
        }
        run_style = style;
        run.push(ch);
    }
    if !run.is_empty() {
        spans.push(Span::styled(run, run_style));
    }
    if cursor == Some(text.len()) {
        spans.push(Span::styled(" ", base.add_modifier(Modifier::REVERSED)));
    }
    Line::from(spans)
}

fn draw_browser(frame: &mut Frame<'_>, state: &SessionState) {
    let area = frame.size();
    let layout = screen_layout(area.width, area.height);

    draw_top_bar(frame, layout.top, state);
    draw_preview(frame, layout.preview, state);
    if state.mode == Mode::TagPopup {
        draw_tags(frame, layout.side, state);
    } else {
        draw_results(frame, layout.side, state);
    }
    draw_status_bar(frame, layout.status, state);
}

fn draw_top_bar(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let page = format!("Page {} ", state.page);
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(UnicodeWidthStr::width(page.as_str()) as u16),
        ])
        .split(area);
    let style = Style::default()
        .fg(COLOR_TEXT_PRIMARY)
        .bg(COLOR_PANEL_FOCUSED_BG)
        .add_modifier(Modifier::BOLD);
    frame.render_widget(
        Paragraph::new(format!(" Query: {}", state.active_query)).style(style),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(page)
            .alignment(Alignment::Right)
            .style(style),
        chunks[1],
    );
}

fn draw_preview(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Thick)
        .border_style(Style::default().fg(COLOR_BORDER_FOCUSED))
        .style(Style::default().bg(COLOR_PANEL_BG));

    let body = match &state.preview {
        PreviewContent::Loading => Text::from(format!(
            "{} Loading preview...",
            spinner_frame(state.spinner)
        )),
        PreviewContent::Message(message) => Text::from(message.as_str()),
        PreviewContent::Warning(message) => Text::styled(
            message.as_str(),
            Style::default().fg(COLOR_WARNING),
        ),
        // Image output is written to the terminal after the frame.
        PreviewContent::Empty | PreviewContent::Image(_) => Text::default(),
    };
    let paragraph = Paragraph::new(body)
        .block(block)
        .alignment(Alignment::Center)
        .style(Style::default().fg(COLOR_TEXT_PRIMARY))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn side_block() -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(COLOR_BORDER_IDLE))
        .style(Style::default().bg(COLOR_PANEL_BG))
}

fn result_row(post: &Post, layout: TableLayout) -> Row<'static> {
    let id = post.id.to_string();
    let score = post.score.total.to_string();
    match layout {
        TableLayout::Narrow => Row::new(vec![id, score]),
        TableLayout::Wide => Row::new(vec![id, post.tags.artists(), score]),
    }
}

fn draw_results(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let (header, widths) = match state.table_layout {
        TableLayout::Narrow => (
            Row::new(vec!["ID", "Score"]),
            vec![Constraint::Length(10), Constraint::Min(5)],
        ),
        TableLayout::Wide => (
            Row::new(vec!["ID", "Artist", "Score"]),
            vec![
                Constraint::Length(10),
                Constraint::Min(10),
                Constraint::Length(7),
            ],
        ),
    };
    let rows: Vec<Row> = state
        .results
        .iter()
        .map(|post| result_row(post, state.table_layout))
        .collect();

    let table = Table::new(rows, widths)
        .header(
            header
                .style(
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD),
                )
                .bottom_margin(1),
        )
        .block(side_block())
        .style(Style::default().fg(COLOR_TEXT_PRIMARY))
        .highlight_style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_PANEL_SELECTED_BG)
                .add_modifier(Modifier::BOLD),
        );

    let mut table_state = TableState::default();
    if !state.results.is_empty() {
        table_state.select(Some(state.selected));
    }
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn draw_tags(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let mut lines = vec![
        Line::from(Span::styled(
            "Tags:",
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        )),
        Line::default(),
    ];
    lines.push(Line::from(state.tag_text.clone()));
    let tags = Paragraph::new(lines)
        .block(side_block())
        .style(Style::default().fg(COLOR_TEXT_PRIMARY))
        .wrap(Wrap { trim: true })
        .scroll((state.tag_scroll, 0));
    frame.render_widget(tags, area);
}

fn image_mode_label(show_full_image: bool) -> &'static str {
    if show_full_image {
        "[full]/sample"
    } else {
        "full/[sample]"
    }
}

/// Status bar contents, highest priority first: tag popup help, the search
/// editor, a transient message, then key help.
pub fn status_line(state: &SessionState) -> Line<'static> {
    if state.mode == Mode::TagPopup {
        return Line::from("t/esc: close tags popup");
    }
    if state.search_focused {
        let mut line = search_line(&state.editor, true);
        line.spans.insert(0, Span::raw("Filter: "));
        return line;
    }
    if let Some(message) = &state.status_message {
        return Line::from(message.clone());
    }

    let mut help = format!(
        "↑/↓: nav | ←/→: page | c: copy url | /: filter | r: refresh | e: {} | t: show tags popup",
        image_mode_label(state.show_full_image)
    );
    let has_pool = state
        .selected_post()
        .is_some_and(|post| post.first_pool().is_some());
    if !state.loading && has_pool {
        help.push_str(" | p: view pool");
    }
    help.push_str(" | esc: back to menu");
    Line::from(help)
}

fn draw_status_bar(frame: &mut Frame<'_>, area: Rect, state: &SessionState) {
    let status = Paragraph::new(status_line(state)).style(
        Style::default()
            .fg(COLOR_TEXT_SECONDARY)
            .bg(COLOR_PANEL_BG),
    );
    frame.render_widget(status, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FetchError, FileRef, Tags};
    use crate::session::{self, Event, SessionError};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    fn draw(state: &SessionState) -> String {
        let backend = TestBackend::new(state.width, state.height);
        let mut terminal = Terminal::new(backend).unwrap();
        terminal.draw(|frame| render(frame, state)).unwrap();
        let buffer = terminal.backend().buffer().clone();
        let mut out = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                out.push_str(buffer.get(x, y).symbol());
            }
            out.push('\n');
        }
        out
    }

    fn plain(line: &Line<'_>) -> String {
        line.spans.iter().map(|span| span.content.as_ref()).collect()
    }

    fn press(state: &mut SessionState, code: KeyCode) {
        session::update(state, Event::Key(KeyEvent::new(code, KeyModifiers::NONE)));
    }

    fn posts() -> Vec<Post> {
        vec![
            Post {
                id: 101,
                pools: vec![55],
                tags: Tags {
                    general: vec!["wolf".into()],
                    artist: vec!["someone".into()],
                    ..Tags::default()
                },
                file: FileRef {
                    url: Some("https://static.test/101.png".into()),
                    ..FileRef::default()
                },
                ..Post::default()
            },
            Post {
                id: 102,
                ..Post::default()
            },
        ]
    }

    fn browsing(width: u16, height: u16) -> SessionState {
        let mut state = SessionState::new(width, height);
        for c in "wolf".chars() {
            press(&mut state, KeyCode::Char(c));
        }
        press(&mut state, KeyCode::Enter);
        let generation = state.fetch_generation();
        session::update(
            &mut state,
            Event::PostsFetched {
                generation,
                result: Ok(posts()),
            },
        );
        state
    }

    #[test]
    fn layout_splits_preview_three_quarters() {
        let layout = screen_layout(120, 40);
        assert_eq!(layout.preview, Rect::new(0, 1, 90, 38));
        assert_eq!(layout.side, Rect::new(90, 1, 30, 38));
        assert_eq!(layout.status.y, 39);
        assert_eq!(layout.preview_placement().directive(), "88x36@2x1");
        assert_eq!(layout.table_rows(), 34);
    }

    #[test]
    fn layout_survives_tiny_terminals() {
        let layout = screen_layout(0, 0);
        assert_eq!(layout.table_rows(), 0);
        assert_eq!(layout.preview_placement().directive(), "0x0@2x0");
    }

    #[test]
    fn search_line_highlights_filters() {
        let editor = LineEditor::with_text("fox order:rank");
        let line = search_line(&editor, false);
        let styled: Vec<(&str, Option<Color>)> = line
            .spans
            .iter()
            .map(|span| (span.content.as_ref(), span.style.fg))
            .collect();
        assert_eq!(
            styled,
            vec![
                ("fox ", Some(COLOR_TEXT_PRIMARY)),
                ("order", Some(COLOR_SUCCESS)),
                (":", Some(COLOR_TEXT_PRIMARY)),
                ("rank", Some(COLOR_WARNING)),
            ]
        );
    }

    #[test]
    fn search_line_shows_cursor_at_end() {
        let editor = LineEditor::with_text("wolf");
        let line = search_line(&editor, true);
        let last = line.spans.last().unwrap();
        assert_eq!(last.content.as_ref(), " ");
        assert!(last.style.add_modifier.contains(Modifier::REVERSED));
    }

    #[test]
    fn menu_shows_buttons_and_help() {
        let state = SessionState::new(80, 24);
        let screen = draw(&state);
        assert!(screen.contains("Latest"));
        assert!(screen.contains("Popular"));
        assert!(screen.contains("enter: search | tab: select buttons"));
    }

    #[test]
    fn quit_prompt_is_drawn() {
        let mut state = SessionState::new(80, 24);
        press(&mut state, KeyCode::Esc);
        assert!(draw(&state).contains(QUIT_PROMPT));
    }

    #[test]
    fn loading_screen_names_query() {
        let mut state = SessionState::new(80, 24);
        for c in "wolf".chars() {
            press(&mut state, KeyCode::Char(c));
        }
        press(&mut state, KeyCode::Enter);
        assert!(draw(&state).contains("Fetching data for 'wolf'..."));
    }

    #[test]
    fn error_box_tells_how_to_leave() {
        let mut state = SessionState::new(80, 24);
        state.fail(SessionError::Fetch(FetchError::Network("connection refused".into())));
        let screen = draw(&state);
        assert!(screen.contains("An error occurred:"));
        assert!(screen.contains("connection refused"));
        assert!(screen.contains("Press Esc to quit."));
    }

    #[test]
    fn browser_shows_query_table_and_pool_hint() {
        let state = browsing(200, 30);
        let screen = draw(&state);
        assert!(screen.contains("Query: wolf"));
        assert!(screen.contains("Page 1"));
        assert!(screen.contains("Artist"));
        assert!(screen.contains("someone"));
        assert!(screen.contains("unknown"));
        assert!(screen.contains("Loading preview..."));

        let status = plain(&status_line(&state));
        assert!(status.contains("p: view pool"));
        assert!(status.contains("full/[sample]"));
    }

    #[test]
    fn narrow_table_drops_artist_column() {
        let state = browsing(120, 30);
        let screen = draw(&state);
        assert!(screen.contains("Score"));
        assert!(!screen.contains("Artist"));
    }

    #[test]
    fn status_bar_priorities() {
        let mut state = browsing(120, 30);
        press(&mut state, KeyCode::Down);
        assert!(!plain(&status_line(&state)).contains("p: view pool"));

        press(&mut state, KeyCode::Char('c'));
        assert_eq!(plain(&status_line(&state)), "Copied link to clipboard!");

        press(&mut state, KeyCode::Char('/'));
        assert!(plain(&status_line(&state)).starts_with("Filter: wolf"));
        press(&mut state, KeyCode::Esc);

        press(&mut state, KeyCode::Char('t'));
        assert_eq!(plain(&status_line(&state)), "t/esc: close tags popup");
    }

    #[test]
    fn tag_popup_replaces_table() {
        let mut state = browsing(120, 30);
        press(&mut state, KeyCode::Char('t'));
        let screen = draw(&state);
        assert!(screen.contains("Tags:"));
        assert!(screen.contains("wolf, someone"));
        assert!(!screen.contains("Score"));
    }
}
